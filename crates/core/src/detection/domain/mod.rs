pub mod coordinate_mapper;
pub mod face_attributes;
pub mod face_detection;
pub mod inference_adapter;
