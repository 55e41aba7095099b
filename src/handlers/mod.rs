pub mod chunk_handlers;
pub mod extract;
pub mod health_handlers;
pub mod share_handlers;
pub mod storage_handlers;
