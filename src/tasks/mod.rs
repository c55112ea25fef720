pub mod fanout;
pub mod flusher;
pub mod ingest;
