use crate::error::Result;

/// Lines used by the SPI slave handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    /// Output: a transaction is armed and the host may clock.
    Handshake,
    /// Output: at least one real frame is waiting to be read.
    DataReady,
    /// Input: the bus chip-select, driven by the host (active low).
    ChipSelect,
}

/// Electrical level of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn is_low(self) -> bool {
        self == Level::Low
    }
}

/// Edge selection for input interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Any,
}

impl Edge {
    /// Whether a transition from `from` to `to` matches this edge.
    pub fn matches(self, from: Level, to: Level) -> bool {
        match self {
            Edge::Rising => from.is_low() && to.is_high(),
            Edge::Falling => from.is_high() && to.is_low(),
            Edge::Any => from != to,
        }
    }
}

/// Interrupt handler, called with the new level of the line.
pub type EdgeHandler = Box<dyn Fn(Level) + Send + Sync>;

/// GPIO boundary consumed by the signal state machine.
pub trait Gpio: Send + Sync {
    /// Drive an output line.
    fn set_level(&self, line: Line, level: Level);

    /// Sample a line.
    fn level(&self, line: Line) -> Level;

    /// Install an edge interrupt on an input line.
    fn configure_interrupt(&self, line: Line, edge: Edge, handler: EdgeHandler) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_matching() {
        assert!(Edge::Falling.matches(Level::High, Level::Low));
        assert!(!Edge::Falling.matches(Level::Low, Level::High));
        assert!(Edge::Rising.matches(Level::Low, Level::High));
        assert!(Edge::Any.matches(Level::Low, Level::High));
        assert!(!Edge::Any.matches(Level::High, Level::High));
    }
}
