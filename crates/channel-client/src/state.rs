use std::fmt;

/// Lifecycle of a client channel.
///
/// ```text
/// Init -> Connecting -> Open -> Closing -> Closed
///   |         |          |
///   |         +----------+-----> Error
///   +--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Init,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Error)
    }

    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Init, Connecting)
                | (Init, Closed)
                | (Connecting, Open)
                | (Connecting, Error)
                | (Open, Closing)
                | (Open, Error)
                | (Closing, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Init => "init",
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
            ChannelState::Error => "error",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelState::*;

    #[test_timeout::timeout]
    fn terminal_states_have_no_exits() {
        for from in [Closed, Error] {
            assert!(from.is_terminal());
            for to in [Init, Connecting, Open, Closing, Closed, Error] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test_timeout::timeout]
    fn open_is_only_reachable_from_connecting() {
        assert!(Connecting.can_transition_to(Open));
        assert!(!Init.can_transition_to(Open));
        assert!(!Closing.can_transition_to(Open));
    }
}
