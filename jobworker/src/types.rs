use uuid::Uuid;

pub type Program = String;
pub type Args = Vec<String>;
pub type JobId = Uuid;
/// Identity of an authenticated caller, as delivered by the transport layer.
pub type UserId = String;
pub type OutputBlob = bytes::Bytes;
