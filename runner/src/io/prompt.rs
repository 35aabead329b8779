//! Prompt builder for step payloads and system instructions.
//!
//! Payload templates mark their sections with
//! `<!-- section:KEY required|truncatable|droppable -->`. After rendering, sections are
//! parsed back out so the builder can keep the payload within a byte budget: optional
//! context is dropped first, then the bodies of truncatable inputs are shortened.
//! Required sections (the feedback to address, the model under validation) are never cut.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");
const VALIDATE_TEMPLATE: &str = include_str!("prompts/validate.md");

pub const PLANNER_INSTRUCTION: &str = include_str!("prompts/planner_system.md");
pub const GENERATOR_INSTRUCTION: &str = include_str!("prompts/generator_system.md");
pub const VALIDATOR_INSTRUCTION: &str = include_str!("prompts/validator_system.md");

/// Sections dropped first when a payload exceeds the budget.
const DROP_ORDER: [&str; 3] = ["summary", "comments", "notes"];
const TRUNCATION_MARKER: &str = "\n[truncated]";
const SEPARATOR: &str = "\n\n";

/// Inputs for the plan payload.
#[derive(Debug, Clone)]
pub struct PlanInputs<'a> {
    pub requirements: &'a str,
}

/// Inputs for the generate payload.
#[derive(Debug, Clone)]
pub struct GenerateInputs<'a> {
    pub requirements: &'a str,
    pub plan: &'a str,
    /// Present when regenerating after an invalid validation.
    pub previous: Option<PreviousAttempt<'a>>,
}

/// The rejected attempt a regeneration revises.
#[derive(Debug, Clone, Serialize)]
pub struct PreviousAttempt<'a> {
    pub artifact: &'a str,
    pub comments: &'a str,
    pub feedback: &'a str,
}

/// Inputs for the validate payload.
#[derive(Debug, Clone)]
pub struct ValidateInputs<'a> {
    pub requirements: &'a str,
    pub plan_summary: &'a str,
    pub plan: &'a str,
    pub artifact: &'a str,
    pub generator_comments: &'a str,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        env.add_template("generate", GENERATE_TEMPLATE)
            .expect("generate template should be valid");
        env.add_template("validate", VALIDATE_TEMPLATE)
            .expect("validate template should be valid");
        Self { env }
    }

    fn render_plan(&self, input: &PlanInputs<'_>) -> Result<String> {
        let template = self.env.get_template("plan")?;
        let rendered = template.render(context! {
            requirements => input.requirements.trim(),
        })?;
        Ok(rendered)
    }

    fn render_generate(&self, input: &GenerateInputs<'_>) -> Result<String> {
        let previous = input.previous.as_ref().map(|prev| PreviousAttempt {
            artifact: prev.artifact.trim(),
            comments: prev.comments.trim(),
            feedback: prev.feedback.trim(),
        });
        let template = self.env.get_template("generate")?;
        let rendered = template.render(context! {
            requirements => input.requirements.trim(),
            plan => input.plan.trim(),
            previous => previous,
        })?;
        Ok(rendered)
    }

    fn render_validate(&self, input: &ValidateInputs<'_>) -> Result<String> {
        let template = self.env.get_template("validate")?;
        let rendered = template.render(context! {
            requirements => input.requirements.trim(),
            summary => non_empty(input.plan_summary),
            plan => input.plan.trim(),
            comments => non_empty(input.generator_comments),
            artifact => input.artifact.trim(),
        })?;
        Ok(rendered)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    /// Sent verbatim, whatever the budget.
    Required,
    /// Kept, but its body may be shortened. The opening line and closing tag stay.
    Truncatable,
    /// Removed whole, in [`DROP_ORDER`].
    Droppable,
}

impl SectionKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "required" => Some(SectionKind::Required),
            "truncatable" => Some(SectionKind::Truncatable),
            "droppable" => Some(SectionKind::Droppable),
            _ => None,
        }
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    kind: SectionKind,
    /// Section content without its marker.
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|truncatable|droppable)\s*-->")
            .expect("section regex should compile")
    });

    let markers: Vec<_> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let kind = SectionKind::parse(caps.get(2)?.as_str())?;
            Some((whole.start(), whole.end(), key, kind))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, end, key, kind)) in markers.iter().enumerate() {
        let next_start = markers
            .get(i + 1)
            .map(|(start, ..)| *start)
            .unwrap_or(rendered.len());
        let content = rendered[*end..next_start].trim().to_string();
        if !content.is_empty() || *kind != SectionKind::Droppable {
            sections.push(ParsedSection {
                key: key.clone(),
                kind: *kind,
                content,
            });
        }
    }
    sections
}

/// Byte length of the payload once sections are joined.
fn payload_len(sections: &[ParsedSection]) -> usize {
    let content: usize = sections.iter().map(|s| s.content.len()).sum();
    content + SEPARATOR.len() * sections.len().saturating_sub(1)
}

/// Drop droppable sections in [`DROP_ORDER`] until the payload fits, then
/// shorten the largest truncatable section, then the next largest, and so on.
///
/// Required sections are left alone, so a payload whose required content alone
/// exceeds the budget is sent over budget.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if payload_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections
            .iter()
            .position(|s| s.key == key && s.kind == SectionKind::Droppable)
        {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let mut shortened = vec![false; sections.len()];
    loop {
        let len = payload_len(sections);
        if len <= budget {
            return;
        }
        let candidate = sections
            .iter()
            .enumerate()
            .filter(|(i, s)| s.kind == SectionKind::Truncatable && !shortened[*i])
            .max_by_key(|(_, s)| s.content.len())
            .map(|(i, _)| i);
        let Some(idx) = candidate else {
            warn!(budget, payload_len = len, "payload exceeds budget with only required content left");
            return;
        };
        shortened[idx] = true;
        let section = &mut sections[idx];
        let before_len = section.content.len();
        shorten_body(&mut section.content, len - budget);
        debug!(
            section = %section.key,
            before_len,
            after_len = section.content.len(),
            "truncated section for budget"
        );
    }
}

/// Remove at least `excess` bytes from a tagged section's body, keeping its
/// opening line and closing tag. The body may end up empty.
fn shorten_body(content: &mut String, excess: usize) {
    let head = content.find('\n').map_or(0, |i| i + 1);
    let tail = match content.rfind('\n') {
        Some(i) if content[i + 1..].starts_with("</") => i.max(head),
        _ => content.len(),
    };
    let mut body = content[head..tail].to_string();
    if body.len() <= TRUNCATION_MARKER.len() {
        return;
    }
    let keep = body.len().saturating_sub(excess + TRUNCATION_MARKER.len());
    truncate_at_char_boundary(&mut body, keep);
    body.push_str(TRUNCATION_MARKER);
    *content = format!("{}{}{}", &content[..head], body, &content[tail..]);
}

fn truncate_at_char_boundary(text: &mut String, max_len: usize) {
    let mut cut = max_len.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

/// Builds step payloads within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_plan(&self, input: &PlanInputs<'_>) -> Result<PromptPack> {
        let rendered = PromptEngine::new()
            .render_plan(input)
            .context("render plan payload")?;
        Ok(self.pack(&rendered))
    }

    pub fn build_generate(&self, input: &GenerateInputs<'_>) -> Result<PromptPack> {
        let rendered = PromptEngine::new()
            .render_generate(input)
            .context("render generate payload")?;
        Ok(self.pack(&rendered))
    }

    pub fn build_validate(&self, input: &ValidateInputs<'_>) -> Result<PromptPack> {
        let rendered = PromptEngine::new()
            .render_validate(input)
            .context("render validate payload")?;
        Ok(self.pack(&rendered))
    }

    fn pack(&self, rendered: &str) -> PromptPack {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        PromptPack {
            content: render_sections(&sections),
        }
    }
}

/// A rendered payload ready to send to a responder.
#[derive(Debug, Clone)]
pub struct PromptPack {
    content: String,
}

impl PromptPack {
    pub fn render(&self) -> String {
        self.content.clone()
    }
}
