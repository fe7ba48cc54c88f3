//! Mirror Builder (§4.6): caches upstream tool catalogues, applies the
//! server/tool/schema caps, and names mirrored tools collision-safely.

mod broker_tools;
mod builder;
mod catalogue;
mod sanitize;

pub use broker_tools::{broker_tools, is_broker_tool_name};
pub use builder::MirrorBuilder;
pub use catalogue::{Catalogue, MirrorCaps, MirrorStatus, MirroredTool};
pub use sanitize::sanitize;
