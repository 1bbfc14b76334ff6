// MIT License - Copyright (c) 2026 Peter Wright
// Panel outputs

/// A single output. Outputs are configured, never discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub id: u16,
    pub active: bool,
}

impl Output {
    pub fn new(id: u16) -> Self {
        Self { id, active: false }
    }

    /// Returns true if the active state changed.
    pub fn set_active(&mut self, active: bool) -> bool {
        let changed = self.active != active;
        self.active = active;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_set_active() {
        let mut output = Output::new(2);
        assert!(!output.active);
        assert!(output.set_active(true));
        assert!(!output.set_active(true));
        assert!(output.set_active(false));
    }
}
