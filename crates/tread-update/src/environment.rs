//! What the manager needs from the page hosting it.

use async_trait::async_trait;

/// How the page is being displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    #[default]
    Browser,
    /// Launched as an installed app.
    Standalone,
    MinimalUi,
    Fullscreen,
}

/// The page running the manager.
pub trait PageEnvironment: Send + Sync {
    /// Reload the page so it runs the assets of the current controller.
    fn reload(&self);

    fn display_mode(&self) -> DisplayMode;
}

/// The user's answer to an install prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallChoice {
    Accepted,
    Dismissed,
}

/// A deferred "add to home screen" prompt captured from the browser.
///
/// A prompt can be shown once.
#[async_trait]
pub trait InstallPrompt: Send + Sync {
    async fn prompt(&self) -> InstallChoice;
}
