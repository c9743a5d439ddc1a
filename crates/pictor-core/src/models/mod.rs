mod artifact;
mod cache_folder;
mod collection;
mod job;
mod request;

pub use artifact::{ArtifactKind, ArtifactRecord, ArtifactSettings, OutputFormat};
pub use cache_folder::CacheFolder;
pub use collection::{Collection, CollectionItem};
pub use job::{JobSettings, JobState, JobStatus, JobType};
pub use request::{Delivery, DeliveryId, ProcessingRequest};
