mod catalog;
mod platform;
mod version;

pub use catalog::{ArtifactCatalog, ArtifactSource, MirrorBases, ToolkitEntry};
pub use platform::{detect_host_platform, Mirror, PlatformDetection, PlatformTag, OS_RELEASE_PATH};
pub use version::ToolkitVersion;
