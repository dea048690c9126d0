use owo_colors::Style;
use std::sync::OnceLock;

static STDOUT_THEME: OnceLock<Theme> = OnceLock::new();
static STDERR_THEME: OnceLock<Theme> = OnceLock::new();

/// Styles for each kind of terminal output
#[derive(Debug, Clone)]
pub struct Theme {
    pub title: Style,
    pub ok: Style,
    pub failure: Style,
    pub caution: Style,
    pub label: Style,
}

impl Theme {
    /// Colored when the stream is a terminal and colors are not disabled
    /// (NO_COLOR, CLICOLOR=0)
    fn for_stream(colors: bool) -> Self {
        if colors { Self::colored() } else { Self::plain() }
    }

    pub fn colored() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            ok: Style::new().green().bold(),
            failure: Style::new().red().bold(),
            caution: Style::new().yellow().bold(),
            label: Style::new().white().dimmed(),
        }
    }

    pub fn plain() -> Self {
        Self {
            title: Style::new(),
            ok: Style::new(),
            failure: Style::new(),
            caution: Style::new(),
            label: Style::new(),
        }
    }
}

/// Theme for stdout
pub fn theme() -> &'static Theme {
    STDOUT_THEME.get_or_init(|| Theme::for_stream(console::colors_enabled()))
}

/// Theme for stderr, where warnings, errors and prompts go
pub fn err_theme() -> &'static Theme {
    STDERR_THEME.get_or_init(|| Theme::for_stream(console::colors_enabled_stderr()))
}
