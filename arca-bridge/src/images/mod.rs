//! Image store: OCI pulls, the tag/digest index, and the layer cache that
//! turns OCI tar layers into EXT4 block images.

pub mod layer_cache;
pub mod manager;
pub mod reference;

pub use layer_cache::{LayerCache, LayerCacheRecorder, NullRecorder};
pub use manager::{
    ImageManager, ImageRecord, LayerInfo, PullEvent, PullProgress, RegistryCredentials,
};
pub use reference::normalize_reference;
