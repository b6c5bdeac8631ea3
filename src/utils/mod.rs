/// 工具模块
/// Utility modules
pub mod letterbox;

pub use letterbox::{orient_frame, Letterbox, LetterboxTransform};
