pub mod detection_loop;
pub(crate) mod inference_worker;
pub mod pipeline_logger;
pub mod result_store;
pub(crate) mod ticker;
