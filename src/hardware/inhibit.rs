//! Debounced external inhibit input.

use debouncr::{Debouncer, Edge, Repeat10};

/// The external safety interlock that forces all outputs off while asserted.
pub struct InhibitInput {
    state: Debouncer<u16, Repeat10>,
    inhibited: bool,
}

impl Default for InhibitInput {
    fn default() -> Self {
        Self::new()
    }
}

impl InhibitInput {
    pub fn new() -> Self {
        InhibitInput {
            state: debouncr::debounce_10(false),
            inhibited: false,
        }
    }

    /// Sample the inhibit input.
    ///
    /// # Args
    /// * `asserted` - The raw level of the inhibit input.
    ///
    /// # Returns
    /// The new inhibit state if it changed with this sample.
    pub fn update(&mut self, asserted: bool) -> Option<bool> {
        match self.state.update(asserted) {
            Some(Edge::Rising) => {
                self.inhibited = true;
                Some(true)
            }
            Some(Edge::Falling) => {
                self.inhibited = false;
                Some(false)
            }
            None => None,
        }
    }

    pub fn is_inhibited(&self) -> bool {
        self.inhibited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounces_edges() {
        let mut input = InhibitInput::new();

        // A short glitch is ignored.
        for _ in 0..5 {
            assert_eq!(input.update(true), None);
        }
        assert_eq!(input.update(false), None);
        assert!(!input.is_inhibited());

        let edges: Vec<_> = (0..10).filter_map(|_| input.update(true)).collect();
        assert_eq!(edges, [true]);
        assert!(input.is_inhibited());

        let edges: Vec<_> = (0..10).filter_map(|_| input.update(false)).collect();
        assert_eq!(edges, [false]);
        assert!(!input.is_inhibited());
    }
}
