//! Update flags for player synchronization
//!
//! Tracks which aspects of a player changed this tick and must be
//! carried in the next player-info frame.

use bitflags::bitflags;

bitflags! {
    /// Flags indicating which update blocks a player needs this tick
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UpdateFlags: u32 {
        /// Appearance changed (gender, body parts, colors)
        const APPEARANCE = 1 << 0;
        /// Animation is playing
        const ANIMATION = 1 << 1;
        /// Chat message above the head
        const CHAT = 1 << 2;
        /// Forced movement (scripted slides, agility obstacles)
        const FORCED_MOVE = 1 << 3;
        /// Visibility state changed
        const VISIBILITY = 1 << 4;
        /// Excluded from every other player's viewport. Persists across
        /// ticks; never cleared by the per-tick reset.
        const HIDDEN = 1 << 16;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl UpdateFlags {
    /// Check whether any update block must be emitted
    pub fn has_update(&self) -> bool {
        !self.intersection(Self::transient()).is_empty()
    }

    /// Check whether the appearance block is flagged
    pub fn needs_appearance(&self) -> bool {
        self.contains(Self::APPEARANCE)
    }

    /// Check whether this player is hard-invisible to others
    pub fn is_hidden(&self) -> bool {
        self.contains(Self::HIDDEN)
    }

    /// Clear everything that is emitted-and-forgotten, keeping HIDDEN
    pub fn clear_transient(&mut self) {
        *self = self.intersection(Self::HIDDEN);
    }

    /// The flags that describe per-tick update blocks
    fn transient() -> Self {
        Self::APPEARANCE | Self::ANIMATION | Self::CHAT | Self::FORCED_MOVE | Self::VISIBILITY
    }
}
