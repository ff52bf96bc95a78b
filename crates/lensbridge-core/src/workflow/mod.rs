//! 工作流模块
//!
//! 提供高层 API 封装配对和发送流程

pub mod glasses;

pub use glasses::{Glasses, GlassesError};
