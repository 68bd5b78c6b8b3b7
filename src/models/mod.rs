//! # Data Models
//!
//! SeaORM entities for the job tables and the interned reference data they
//! point at.

pub mod build_platform;
pub mod job;
pub mod job_group;
pub mod job_log;
pub mod job_type;
pub mod machine;
pub mod machine_platform;
pub mod option;
pub mod option_collection;
pub mod product;
pub mod repository;
pub mod repository_version;

pub use build_platform::Entity as BuildPlatform;
pub use job::Entity as Job;
pub use job_group::Entity as JobGroup;
pub use job_log::Entity as JobLog;
pub use job_type::Entity as JobType;
pub use machine::Entity as Machine;
pub use machine_platform::Entity as MachinePlatform;
pub use option::Entity as JobOption;
pub use option_collection::Entity as OptionCollection;
pub use product::Entity as Product;
pub use repository::Entity as Repository;
pub use repository_version::Entity as RepositoryVersion;
