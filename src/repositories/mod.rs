//! # Repository Layer
//!
//! SeaORM implementations of the persistence seams used by the ingestion
//! pipeline.

pub mod job_store;

pub use job_store::SeaOrmJobStore;
