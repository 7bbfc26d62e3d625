pub mod paths;
pub mod receiver;

pub use receiver::{ChunkUpload, SubmitOutcome, UploadReceiver};
