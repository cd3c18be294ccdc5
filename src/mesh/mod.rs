//! Mesh topology resolution and config synthesis
//!
//! A declarative [`MeshSpec`] is resolved into a [`ResolvedMesh`] (address
//! plan, filled keys, neighbor adjacency) and then rendered into per-peer
//! configuration files, an optional routing-daemon fragment, and a manifest,
//! bundled as a zip archive.

pub mod archive;
pub mod render;
pub mod resolver;
pub mod spec;

pub use archive::build_zip;
pub use render::{render_bundle, MeshBundle};
pub use resolver::{resolve, ResolvedClient, ResolvedMesh, ResolvedNode};
pub use spec::{ClientInput, EndpointVersion, MeshSpec, NodeInput};
