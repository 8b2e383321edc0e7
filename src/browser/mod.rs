//! 浏览器实例管理
//!
//! - `headless` - 启动隔离的浏览器实例，设置下载目录
//! - `download` - 等待下载完成

pub mod download;
pub mod headless;

pub use download::wait_for_download;
pub use headless::{launch_isolated_browser, BrowserSession, LaunchOptions};
