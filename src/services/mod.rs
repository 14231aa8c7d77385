pub mod blob_sink;
pub mod upload_service;
