pub mod evidence;
pub mod gate_pipeline;
pub mod regime;
pub mod structural;
pub mod timing;
pub mod types;
