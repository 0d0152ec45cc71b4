pub mod bounding_box;
pub mod constants;
pub mod dimensions;
pub mod frame;
