pub mod cache;
pub mod model;
pub mod repository;
pub mod repository_pg;
