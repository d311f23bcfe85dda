//! Identifier and position wrappers.
//!
//! Contributing agents mint their own identifiers, so [`AgentId`] wraps an
//! opaque string rather than a UUID. [`GridPos`] is the agent's stable cell
//! position on the shared canvas and doubles as its spatial identity in
//! analysis output; on the wire it is a two-element array `[x, y]`.

use serde::{Deserialize, Serialize};

/// Opaque identifier for a contributing agent.
///
/// Used as the unique key in the contribution store, prediction-error maps,
/// and rankings. Ordering is lexicographic, which also serves as the
/// deterministic tie-break in rankings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create an identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (rejected at ingestion).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl core::fmt::Display for AgentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A cell position on the shared canvas grid.
///
/// Serializes as `[x, y]` to match the wire format used by contributing
/// agents and the analysis collaborator. `[0, 0]` is the grid center.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(i32, i32)", into = "(i32, i32)")]
pub struct GridPos {
    /// Horizontal cell coordinate.
    pub x: i32,
    /// Vertical cell coordinate.
    pub y: i32,
}

impl GridPos {
    /// Create a position from coordinates.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Row-major sort key `(y, x)`, the order positions are listed in
    /// analysis prompts.
    pub const fn row_major(self) -> (i32, i32) {
        (self.y, self.x)
    }
}

impl From<(i32, i32)> for GridPos {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

impl From<GridPos> for (i32, i32) {
    fn from(pos: GridPos) -> Self {
        (pos.x, pos.y)
    }
}

impl core::fmt::Display for GridPos {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{},{}]", self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_roundtrip_is_transparent() {
        let id = AgentId::new("agent-7");
        let json = serde_json::to_string(&id).unwrap_or_default();
        assert_eq!(json, "\"agent-7\"");
        let back: Result<AgentId, _> = serde_json::from_str(&json);
        assert_eq!(back.ok(), Some(id));
    }

    #[test]
    fn grid_pos_serializes_as_pair() {
        let pos = GridPos::new(-2, 5);
        let json = serde_json::to_string(&pos).unwrap_or_default();
        assert_eq!(json, "[-2,5]");
        let back: Result<GridPos, _> = serde_json::from_str("[3, -1]");
        assert_eq!(back.ok(), Some(GridPos::new(3, -1)));
    }

    #[test]
    fn row_major_orders_by_y_then_x() {
        let mut positions = vec![GridPos::new(1, 1), GridPos::new(0, 2), GridPos::new(2, 0)];
        positions.sort_by_key(|p| p.row_major());
        assert_eq!(
            positions,
            vec![GridPos::new(2, 0), GridPos::new(1, 1), GridPos::new(0, 2)]
        );
    }
}
