//! `shipline plan` - Describe the pipeline without running it

use shipline::pipeline::PlannedStage;
use std::fmt::Write;

/// Renders planned stages as an indented listing
#[must_use]
pub fn render_plan(stages: &[PlannedStage]) -> String {
    let mut out = String::new();
    for planned in stages {
        let _ = writeln!(
            out,
            "[{}] {}",
            planned.stage.ordinal(),
            planned.stage.title()
        );
        section(&mut out, "images", &planned.images);
        section(&mut out, "services", &planned.services);
        section(&mut out, "consumes", &planned.consumes);
        section(&mut out, "declares", &planned.declares);
        section(&mut out, "tags", &planned.tags);
    }
    out
}

fn section<S: AsRef<str>>(out: &mut String, label: &str, items: &[S]) {
    if items.is_empty() {
        return;
    }
    let joined: Vec<&str> = items.iter().map(<S as AsRef<str>>::as_ref).collect();
    let _ = writeln!(out, "    {label:<9} {}", joined.join(", "));
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipline::infrastructure::PipelineConfig;
    use shipline::pipeline::{ShortRevision, plan};

    #[test]
    fn test_render_plan_lists_every_stage() {
        let revision = ShortRevision::from_full("abc123456").unwrap();
        let text = render_plan(&plan(&PipelineConfig::default(), "acme", &revision));

        assert!(text.contains("[1] Data Processing"));
        assert!(text.contains("[4] Vulnerability Scan"));
        assert!(text.contains("acme/house-price-predictor-service:abc1234"));
        assert!(text.contains("acme/house-price-predictor-service:latest"));
    }

    #[test]
    fn test_render_plan_skips_empty_sections() {
        let revision = ShortRevision::from_full("abc123456").unwrap();
        let stages = plan(&PipelineConfig::default(), "acme", &revision);
        let text = render_plan(&stages[..1]);

        assert!(!text.contains("services"));
        assert!(!text.contains("tags"));
    }
}
