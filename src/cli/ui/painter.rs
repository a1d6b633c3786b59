use owo_colors::{OwoColorize, Style as OwoStyle};

use crate::connection::ConnectionState;

const STRONG_RSSI: i16 = -60;
const WEAK_RSSI: i16 = -80;

/// Applies terminal colour when stdout is a terminal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading(self, text: &str) -> String {
        self.paint(text, OwoStyle::new().bold().cyan())
    }

    pub(crate) fn muted(self, text: &str) -> String {
        self.paint(text, OwoStyle::new().dimmed())
    }

    pub(crate) fn value(self, text: &str) -> String {
        self.paint(text, OwoStyle::new().bold())
    }

    /// Green for strong signals, yellow for usable ones, red below that.
    pub(crate) fn rssi(self, rssi: Option<i16>) -> String {
        let Some(rssi) = rssi else {
            return self.muted("-");
        };
        let style = if rssi >= STRONG_RSSI {
            OwoStyle::new().green()
        } else if rssi >= WEAK_RSSI {
            OwoStyle::new().yellow()
        } else {
            OwoStyle::new().red()
        };
        self.paint(&format!("{rssi} dBm"), style)
    }

    pub(crate) fn state(self, state: ConnectionState) -> String {
        let style = match state {
            ConnectionState::Connected => OwoStyle::new().green(),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                OwoStyle::new().yellow()
            }
            ConnectionState::Disconnected | ConnectionState::Undetermined => {
                OwoStyle::new().dimmed()
            }
        };
        self.paint(&state.to_string(), style)
    }

    fn paint(self, text: &str, style: OwoStyle) -> String {
        if self.use_colour {
            text.style(style).to_string()
        } else {
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Some(-42), "-42 dBm")]
    #[case(Some(-95), "-95 dBm")]
    #[case(None, "-")]
    fn plain_rssi_has_no_escape_codes(#[case] rssi: Option<i16>, #[case] expected: &str) {
        assert_eq!(expected, Painter::new(false).rssi(rssi));
    }

    #[rstest]
    #[case(-50)]
    #[case(-70)]
    #[case(-90)]
    fn coloured_rssi_wraps_text(#[case] rssi: i16) {
        let styled = Painter::new(true).rssi(Some(rssi));
        assert!(styled.contains(&rssi.to_string()));
        assert!(styled.starts_with('\u{1b}'));
    }

    #[test]
    fn plain_state_uses_display_name() {
        assert_eq!(
            ConnectionState::Connected.to_string(),
            Painter::new(false).state(ConnectionState::Connected)
        );
    }
}
