pub mod engine;
pub mod file_ops;
pub mod overwrite;
pub mod path_guard;
pub mod plan;
pub mod task;
pub mod task_queue;
pub mod task_store;
pub mod trash;
