//! Splitting, dispatch and reduction of disaggregation tasks.

pub mod driver;
pub mod split;

pub use driver::{TaskReport, run};
pub use split::{
    Task, estimate_matrix_bytes, estimate_peak_bytes, estimate_task_bytes, preflight, split_tasks,
};
