//! Chord assembler state machine
//!
//! Single-writer reducer: every transition goes through [`reduce`], which
//! returns the next state plus the effects the dispatcher must carry out
//! (arm or cancel the debounce timer, dispatch a chord). Keeping the timer
//! and command execution out of here lets the debounce rules be tested
//! without a runtime.

/// Answers whether a partial chord could still grow into a configured one
pub trait PrefixTest {
    fn is_prefix(&self, chord: &str) -> bool;
}

impl<F: Fn(&str) -> bool> PrefixTest for F {
    fn is_prefix(&self, chord: &str) -> bool {
        self(chord)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChordState {
    /// Normalized code names since the last dispatch
    pub buffer: Vec<String>,
    /// Global lock: while set, key releases are dropped
    pub locked: bool,
    /// Whether a debounce timer is armed
    pub waiting: bool,
}

impl ChordState {
    /// Comma-joined buffer, the form handed to the resolver
    pub fn chord(&self) -> String {
        self.buffer.join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A key was released; `code` is already normalized
    KeyReleased { code: String },
    /// The debounce timer expired
    DebounceElapsed,
    /// The dispatcher ran a lock or unlock key
    LockChanged { locked: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    CancelTimer,
    ArmTimer,
    Dispatch { chord: String },
    /// Key dropped because the keyboard is locked
    Discard { code: String },
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// - A release while locked is discarded and the buffer is left untouched.
/// - An armed timer is always cancelled before a new one is armed.
/// - A chord that is not a strict prefix of a configured key fires at once.
/// - Every dispatch empties the buffer, whether or not the chord resolves.
pub fn reduce(state: &ChordState, event: Event, prefix: &impl PrefixTest) -> (ChordState, Vec<Effect>) {
    use Effect::*;

    match event {
        Event::KeyReleased { code } if state.locked => (state.clone(), vec![Discard { code }]),

        Event::KeyReleased { code } => {
            let mut next = state.clone();
            let mut effects = Vec::with_capacity(2);

            if next.waiting {
                effects.push(CancelTimer);
            }
            next.buffer.push(code);

            let chord = next.chord();
            if prefix.is_prefix(&chord) {
                next.waiting = true;
                effects.push(ArmTimer);
            } else {
                next.buffer.clear();
                next.waiting = false;
                effects.push(Dispatch { chord });
            }
            (next, effects)
        }

        Event::DebounceElapsed if state.buffer.is_empty() => (
            ChordState {
                waiting: false,
                ..state.clone()
            },
            vec![],
        ),

        Event::DebounceElapsed => {
            let chord = state.chord();
            (
                ChordState {
                    buffer: Vec::new(),
                    locked: state.locked,
                    waiting: false,
                },
                vec![Dispatch { chord }],
            )
        }

        Event::LockChanged { locked } => (
            ChordState {
                locked,
                ..state.clone()
            },
            vec![],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Configured physical keys "hi" and "hello"
    fn prefixes(chord: &str) -> bool {
        let chord = chord.replace(',', "");
        ["hi", "hello"]
            .iter()
            .any(|k| k.len() > chord.len() && k.starts_with(&chord))
    }

    fn release(code: &str) -> Event {
        Event::KeyReleased { code: code.into() }
    }

    #[test]
    fn test_non_prefix_dispatches_immediately() {
        let (next, effects) = reduce(&ChordState::default(), release("x"), &prefixes);

        assert_eq!(effects, vec![Effect::Dispatch { chord: "x".into() }]);
        assert!(next.buffer.is_empty());
        assert!(!next.waiting);
    }

    #[test]
    fn test_prefix_arms_timer() {
        let (next, effects) = reduce(&ChordState::default(), release("h"), &prefixes);

        assert_eq!(effects, vec![Effect::ArmTimer]);
        assert_eq!(next.buffer, vec!["h".to_string()]);
        assert!(next.waiting);
    }

    #[test]
    fn test_new_key_restarts_pending_timer() {
        let (state, _) = reduce(&ChordState::default(), release("h"), &prefixes);
        let (next, effects) = reduce(&state, release("e"), &prefixes);

        assert_eq!(effects, vec![Effect::CancelTimer, Effect::ArmTimer]);
        assert_eq!(next.chord(), "h,e");
    }

    #[test]
    fn test_exact_match_fires_without_waiting() {
        let (state, _) = reduce(&ChordState::default(), release("h"), &prefixes);
        let (next, effects) = reduce(&state, release("i"), &prefixes);

        assert_eq!(
            effects,
            vec![
                Effect::CancelTimer,
                Effect::Dispatch {
                    chord: "h,i".into()
                }
            ]
        );
        assert!(next.buffer.is_empty());
        assert!(!next.waiting);
    }

    #[test]
    fn test_timer_flushes_partial_chord() {
        let (state, _) = reduce(&ChordState::default(), release("h"), &prefixes);
        let (next, effects) = reduce(&state, Event::DebounceElapsed, &prefixes);

        assert_eq!(effects, vec![Effect::Dispatch { chord: "h".into() }]);
        assert_eq!(next, ChordState::default());
    }

    #[test]
    fn test_stray_timer_with_empty_buffer_does_nothing() {
        let (next, effects) = reduce(&ChordState::default(), Event::DebounceElapsed, &prefixes);
        assert!(effects.is_empty());
        assert_eq!(next, ChordState::default());
    }

    #[test]
    fn test_locked_keyboard_discards_releases() {
        let (locked, effects) = reduce(
            &ChordState::default(),
            Event::LockChanged { locked: true },
            &prefixes,
        );
        assert!(effects.is_empty());

        let (next, effects) = reduce(&locked, release("x"), &prefixes);
        assert_eq!(effects, vec![Effect::Discard { code: "x".into() }]);
        assert!(next.buffer.is_empty());

        let (unlocked, _) = reduce(&next, Event::LockChanged { locked: false }, &prefixes);
        let (_, effects) = reduce(&unlocked, release("x"), &prefixes);
        assert_eq!(effects, vec![Effect::Dispatch { chord: "x".into() }]);
    }
}
