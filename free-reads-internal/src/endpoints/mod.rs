pub mod fallback;
pub mod free_reads;
pub mod status;
