pub mod chunk_service;
pub mod cleanup;
pub mod locks;
pub mod repository;
pub mod share_service;
