pub mod replay_inference_adapter;
