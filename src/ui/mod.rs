//! Terminal output helpers
//!
//! Interactive terminals get glyphs and color; pipes and CI get plain
//! bracketed tags so output stays grep-friendly.

use console::style;
use std::io::IsTerminal;

const CI_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "BUILDKITE",
    "JENKINS_URL",
    "TF_BUILD",
];

/// Output context detected once per command
#[derive(Debug, Clone, Copy)]
pub struct UiContext {
    interactive: bool,
}

impl UiContext {
    /// Detect the current environment
    pub fn detect() -> Self {
        let interactive = std::io::stdout().is_terminal()
            && !CI_VARS.iter().any(|v| std::env::var_os(v).is_some());
        Self { interactive }
    }

    /// Plain output regardless of terminal
    pub fn non_interactive() -> Self {
        Self { interactive: false }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }
}

/// Display a section header
pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.interactive {
        println!("{}", style(title).cyan().bold());
    } else {
        println!("{}", title);
    }
    println!();
}

/// Display a success step with detail
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.interactive {
        println!("  {} {} ({})", style("✔").green(), message, style(detail).dim());
    } else {
        println!("  [OK] {} ({})", message, detail);
    }
}

/// Display an info step
pub fn step_info(ctx: &UiContext, message: &str) {
    if ctx.interactive {
        println!("  {} {}", style("•").cyan(), message);
    } else {
        println!("  [INFO] {}", message);
    }
}

/// Display a warning step with hint
pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    if ctx.interactive {
        println!("  {} {} - {}", style("!").yellow(), message, style(hint).dim());
    } else {
        println!("  [WARN] {} - {}", message, hint);
    }
}

/// Print an indented key-value pair
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.interactive {
        println!("    {}: {}", style(key).dim(), value);
    } else {
        println!("    {}: {}", key, value);
    }
}
