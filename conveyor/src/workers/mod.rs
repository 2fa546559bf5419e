//! Workers executing stage transforms.

pub mod pool;
pub mod transform;
