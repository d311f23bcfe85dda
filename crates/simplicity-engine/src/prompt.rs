//! Prompt template loading and rendering via `minijinja`.
//!
//! Templates are loaded from the filesystem (default: `templates/`
//! directory) so operators can tune the analysis instructions without
//! recompiling. Two templates drive the two stages: `observation.j2`
//! (structures + description complexity from the canvas image) and
//! `narration.j2` (narrative + generative complexity + prediction errors
//! from the contribution records).

use minijinja::Environment;
use simplicity_types::GridPos;

use crate::error::EngineError;

/// Agent-count threshold past which the position list gains a grid-span
/// summary so the analyst does not lose the bounding box in the noise.
const GRID_SPAN_THRESHOLD: usize = 25;

/// Manages prompt template loading and rendering.
///
/// Wraps a `minijinja` [`Environment`] with both stage templates
/// pre-loaded. Templates edited on disk are picked up on the next call to
/// [`PromptEngine::new`].
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    /// Create a new prompt engine loading templates from the given
    /// directory.
    ///
    /// The directory must contain `observation.j2` and `narration.j2`.
    pub fn new(templates_dir: &str) -> Result<Self, EngineError> {
        let mut env = Environment::new();

        let observation_tpl = load_template(templates_dir, "observation.j2")?;
        let narration_tpl = load_template(templates_dir, "narration.j2")?;

        env.add_template_owned("observation", observation_tpl)
            .map_err(|e| {
                EngineError::Template(format!("failed to add observation template: {e}"))
            })?;
        env.add_template_owned("narration", narration_tpl)
            .map_err(|e| {
                EngineError::Template(format!("failed to add narration template: {e}"))
            })?;

        Ok(Self { env })
    }

    /// Render the observation-stage prompt.
    pub fn render_observation(&self, context: &serde_json::Value) -> Result<String, EngineError> {
        self.render("observation", context)
    }

    /// Render the narration-stage prompt.
    pub fn render_narration(&self, context: &serde_json::Value) -> Result<String, EngineError> {
        self.render("narration", context)
    }

    /// Render one named template with the given context.
    fn render(&self, name: &str, context: &serde_json::Value) -> Result<String, EngineError> {
        self.env
            .get_template(name)
            .map_err(|e| EngineError::Template(format!("missing {name} template: {e}")))?
            .render(context)
            .map_err(|e| EngineError::Template(format!("{name} render failed: {e}")))
    }
}

/// Read a template file from disk.
fn load_template(dir: &str, filename: &str) -> Result<String, EngineError> {
    let path = format!("{dir}/{filename}");
    std::fs::read_to_string(&path)
        .map_err(|e| EngineError::Template(format!("failed to read {path}: {e}")))
}

/// Format agent positions for prompt injection.
///
/// Positions are sorted row-major (the order the analyst scans the canvas).
/// Past [`GRID_SPAN_THRESHOLD`] agents, a grid-span summary line is
/// appended so the bounding box stays visible.
pub fn format_positions(positions: &[GridPos]) -> String {
    if positions.is_empty() {
        return "No agent positions available".to_owned();
    }

    let mut sorted = positions.to_vec();
    sorted.sort_by_key(|p| p.row_major());
    let listed = sorted
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    if sorted.len() < GRID_SPAN_THRESHOLD {
        return listed;
    }

    let min_x = sorted.iter().map(|p| p.x).min().unwrap_or(0);
    let max_x = sorted.iter().map(|p| p.x).max().unwrap_or(0);
    let min_y = sorted.iter().map(|p| p.y).min().unwrap_or(0);
    let max_y = sorted.iter().map(|p| p.y).max().unwrap_or(0);
    format!(
        "{listed}\nGRID SPAN: X=[{min_x} to {max_x}], Y=[{min_y} to {max_y}]. [0,0] is CENTER."
    )
}

/// Truncate a string to at most `max_len` bytes on a valid UTF-8 boundary,
/// appending `...` when anything was cut.
pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_owned();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut truncated = s.get(..end).unwrap_or("").to_owned();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_templates(dir: &std::path::Path) {
        std::fs::write(
            dir.join("observation.j2"),
            "Canvas with {{ agents_count }} agents at {{ agent_positions }}.\nRespond with JSON.",
        )
        .ok();
        std::fs::write(
            dir.join("narration.j2"),
            "Observation: {{ observation }}\nContributions: {{ contributions }}\nPrevious: {{ previous_snapshot }}",
        )
        .ok();
    }

    fn unique_temp_dir(tag: &str) -> std::path::PathBuf {
        let unique = format!(
            "simplicity_{tag}_{}_{:?}",
            std::process::id(),
            std::thread::current().id(),
        );
        let dir = std::env::temp_dir().join(unique);
        std::fs::create_dir_all(&dir).ok();
        dir
    }

    #[test]
    fn template_loading_and_rendering() {
        let dir = unique_temp_dir("prompt_templates");
        write_test_templates(&dir);

        let engine = PromptEngine::new(dir.to_str().unwrap_or(""));
        assert!(engine.is_ok(), "engine should load valid templates");
        let Ok(engine) = engine else { return };

        let context = serde_json::json!({
            "agents_count": 3,
            "agent_positions": "[0,0], [1,0]"
        });
        let rendered = engine.render_observation(&context);
        assert!(rendered.is_ok());
        let text = rendered.unwrap_or_default();
        assert!(text.contains("3 agents"));
        assert!(text.contains("[0,0], [1,0]"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_template_returns_error() {
        let dir = unique_temp_dir("prompt_missing");
        std::fs::write(dir.join("observation.j2"), "only one").ok();

        let result = PromptEngine::new(dir.to_str().unwrap_or(""));
        assert!(result.is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn positions_sorted_row_major() {
        let formatted = format_positions(&[
            GridPos::new(1, 1),
            GridPos::new(0, 0),
            GridPos::new(-1, 1),
        ]);
        assert_eq!(formatted, "[0,0], [-1,1], [1,1]");
    }

    #[test]
    fn empty_positions_have_fallback_text() {
        assert_eq!(format_positions(&[]), "No agent positions available");
    }

    #[test]
    fn large_population_gets_grid_span() {
        let positions: Vec<GridPos> = (0..30).map(|i| GridPos::new(i, -i)).collect();
        let formatted = format_positions(&positions);
        assert!(formatted.contains("GRID SPAN: X=[0 to 29], Y=[-29 to 0]"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_text("short", 100), "short");
        let truncated = truncate_text("aaaa\u{e9}bbbb", 5);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 8);
    }
}
