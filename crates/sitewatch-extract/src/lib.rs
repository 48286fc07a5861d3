//! Feature extraction: fetched page -> best-effort marketing snapshot.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sitewatch_core::{fields, FormSignature, PageFetch, Snapshot};
use sitewatch_storage::{domain_slug, ArtifactStore, PageSource};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "sitewatch-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

/// Heuristic tables driving extraction. Loaded from `rules/extraction.yaml`;
/// any key left out keeps its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionRules {
    pub version: u32,
    pub cta_selector: String,
    pub cta_class_markers: Vec<String>,
    pub max_cta_buttons: usize,
    pub testimonial_class_markers: Vec<String>,
    /// Class words that turn a testimonial match into a wrapper, e.g. `testimonial-list`.
    pub testimonial_container_markers: Vec<String>,
    pub quote_selector: String,
    pub attribution_selector: String,
    pub form_selector: String,
    pub form_field_selector: String,
    pub ignored_input_types: Vec<String>,
    pub currency_symbols: Vec<char>,
    pub max_price_points: usize,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            version: 1,
            cta_selector: "button, input[type=submit], input[type=button], [role=button], [class]"
                .to_string(),
            cta_class_markers: vec!["btn".into(), "button".into(), "cta".into()],
            max_cta_buttons: 20,
            testimonial_class_markers: vec!["testimonial".into(), "review".into()],
            testimonial_container_markers: [
                "list", "grid", "wrapper", "container", "carousel", "slider", "section", "wall",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            quote_selector: "blockquote".to_string(),
            attribution_selector: "cite, footer, figcaption".to_string(),
            form_selector: "form".to_string(),
            form_field_selector: "input, select, textarea".to_string(),
            ignored_input_types: vec!["hidden".into()],
            currency_symbols: vec!['$', '€', '£'],
            max_price_points: 20,
        }
    }
}

impl ExtractionRules {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// `rules/extraction.yaml` under the workspace root, or defaults when absent.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("extraction.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_yaml_file(path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    rules: ExtractionRules,
}

impl FeatureExtractor {
    pub fn new(rules: ExtractionRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ExtractionRules {
        &self.rules
    }

    /// Build a snapshot from a fetch result. Never fails: a failed fetch gives a
    /// degraded snapshot, a failing field falls back to its default.
    pub fn extract(&self, fetch: &PageFetch) -> Snapshot {
        let mut snapshot = Snapshot::empty(fetch.domain.clone(), fetch.fetched_at);

        let body = match (&fetch.body, &fetch.error) {
            (Some(body), None) => body,
            (_, error) => {
                snapshot.fetch_error = Some(
                    error
                        .clone()
                        .unwrap_or_else(|| "fetch returned no body".to_string()),
                );
                return snapshot;
            }
        };

        let domain = fetch.domain.as_str();
        let document = Html::parse_document(body);

        snapshot.load_time = fetch.elapsed.map(|d| d.as_secs_f64()).filter(|t| *t > 0.0);
        snapshot.content_hash = Some(ArtifactStore::sha256_hex(body.as_bytes()));
        let failed = &mut snapshot.failed_fields;
        snapshot.cta_buttons =
            or_default(domain, fields::CTA_BUTTONS, self.cta_buttons(&document), failed);
        snapshot.testimonials_count = or_default(
            domain,
            fields::TESTIMONIALS_COUNT,
            self.testimonials_count(&document),
            failed,
        );
        snapshot.form_fields =
            or_default(domain, fields::FORM_FIELDS, self.form_fields(&document), failed);
        snapshot.title = or_default(domain, fields::TITLE, page_title(&document), failed);
        snapshot.meta_description =
            or_default(domain, fields::META_DESCRIPTION, meta_description(&document), failed);
        snapshot.price_points =
            or_default(domain, fields::PRICE_POINTS, self.price_points(&document), failed);

        debug!(
            domain,
            ctas = snapshot.cta_buttons.len(),
            testimonials = snapshot.testimonials_count,
            forms = snapshot.form_fields.len(),
            failed = snapshot.failed_fields.len(),
            "extracted snapshot features"
        );
        snapshot
    }

    /// Real buttons win over anything styled like a button inside them; of
    /// nested class-styled candidates the innermost labelled one is kept.
    fn cta_buttons(&self, document: &Html) -> Result<Vec<String>, ExtractError> {
        let sel = parse_selector(&self.rules.cta_selector)?;
        let candidates = document
            .select(&sel)
            .filter(|el| self.is_cta_candidate(el))
            .collect::<Vec<_>>();

        let buttons = candidates
            .iter()
            .filter(|el| is_button_element(el))
            .map(|el| el.id())
            .collect::<HashSet<_>>();
        let labelled = candidates
            .into_iter()
            .filter(|el| !el.ancestors().any(|node| buttons.contains(&node.id())))
            .filter_map(|el| cta_label(el).map(|label| (el, label)))
            .collect::<Vec<_>>();
        let labelled_ids = labelled.iter().map(|(el, _)| el.id()).collect::<HashSet<_>>();

        Ok(labelled
            .into_iter()
            .filter(|(el, _)| {
                !el.descendants()
                    .skip(1)
                    .any(|node| labelled_ids.contains(&node.id()))
            })
            .map(|(_, label)| label)
            .take(self.rules.max_cta_buttons)
            .collect())
    }

    fn is_cta_candidate(&self, el: &ElementRef<'_>) -> bool {
        is_button_element(el) || class_matches(el, &self.rules.cta_class_markers)
    }

    /// Outermost testimonial items. Wrappers such as `testimonials` or
    /// `review-grid` are not items; parts of an item (`testimonial-text`) are
    /// absorbed by it.
    fn testimonials_count(&self, document: &Html) -> Result<u32, ExtractError> {
        let quote_sel = parse_selector(&self.rules.quote_selector)?;
        let attribution_sel = parse_selector(&self.rules.attribution_selector)?;
        let all = parse_selector("[class]")?;

        let mut items = document
            .select(&all)
            .filter(|el| self.is_testimonial_item(el))
            .collect::<Vec<_>>();
        items.extend(
            document
                .select(&quote_sel)
                .filter(|quote| quote.select(&attribution_sel).next().is_some()),
        );

        let mut ids = HashSet::new();
        items.retain(|el| ids.insert(el.id()));
        let outermost = items
            .iter()
            .filter(|el| !el.ancestors().any(|node| ids.contains(&node.id())))
            .count();
        Ok(u32::try_from(outermost).unwrap_or(u32::MAX))
    }

    fn is_testimonial_item(&self, el: &ElementRef<'_>) -> bool {
        let words = class_words(el);
        let markers = &self.rules.testimonial_class_markers;
        let is_marker = |word: &str| markers.iter().any(|m| m.eq_ignore_ascii_case(word));
        let is_plural_marker = |word: &str| word.strip_suffix('s').is_some_and(is_marker);
        let is_container = |word: &str| {
            self.rules
                .testimonial_container_markers
                .iter()
                .any(|m| m.eq_ignore_ascii_case(word))
        };

        words.iter().any(|w| is_marker(w.as_str()))
            && !words
                .iter()
                .any(|w| is_plural_marker(w.as_str()) || is_container(w.as_str()))
    }

    fn form_fields(&self, document: &Html) -> Result<Vec<FormSignature>, ExtractError> {
        let form_sel = parse_selector(&self.rules.form_selector)?;
        let field_sel = parse_selector(&self.rules.form_field_selector)?;

        Ok(document
            .select(&form_sel)
            .map(|form| {
                let mut field_types: Vec<String> = Vec::new();
                for field in form.select(&field_sel) {
                    let value = field.value();
                    let kind = match value.name() {
                        "input" => value.attr("type").unwrap_or("text").trim().to_ascii_lowercase(),
                        other => other.to_string(),
                    };
                    if self
                        .rules
                        .ignored_input_types
                        .iter()
                        .any(|ignored| ignored.eq_ignore_ascii_case(&kind))
                    {
                        continue;
                    }
                    if !field_types.contains(&kind) {
                        field_types.push(kind);
                    }
                }
                FormSignature { field_types }
            })
            .collect())
    }

    fn price_points(&self, document: &Html) -> Result<Vec<String>, ExtractError> {
        let body_sel = parse_selector("body")?;
        let mut out = Vec::new();
        let Some(body) = document.select(&body_sel).next() else {
            return Ok(out);
        };

        for node in body.descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let in_code = node
                .parent()
                .and_then(|p| p.value().as_element().map(|e| e.name()))
                .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
            if in_code {
                continue;
            }
            for price in scan_price_points(text, &self.rules.currency_symbols) {
                if out.len() >= self.rules.max_price_points {
                    return Ok(out);
                }
                if !out.contains(&price) {
                    out.push(price);
                }
            }
        }
        Ok(out)
    }
}

fn or_default<T: Default>(
    domain: &str,
    field: &'static str,
    result: Result<T, ExtractError>,
    failed: &mut Vec<String>,
) -> T {
    result.unwrap_or_else(|err| {
        warn!(domain, field, error = %err, "field extraction failed; using default");
        failed.push(field.to_string());
        T::default()
    })
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = collapse_whitespace(value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Lowercased words of every class token, split on `-`/`_`.
fn class_words(el: &ElementRef<'_>) -> Vec<String> {
    el.value()
        .classes()
        .flat_map(|class| class.split(['-', '_']))
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

/// A class word matches a marker exactly or as its plural.
fn class_matches(el: &ElementRef<'_>, markers: &[String]) -> bool {
    class_words(el).iter().any(|word| {
        markers.iter().any(|marker| {
            let marker = marker.to_ascii_lowercase();
            *word == marker || word.strip_suffix('s') == Some(marker.as_str())
        })
    })
}

/// `<button>`, a submit/button `<input>`, or anything with `role=button`.
fn is_button_element(el: &ElementRef<'_>) -> bool {
    let value = el.value();
    let native = match value.name() {
        "button" => true,
        "input" => value.attr("type").is_some_and(|kind| {
            kind.eq_ignore_ascii_case("submit") || kind.eq_ignore_ascii_case("button")
        }),
        _ => false,
    };
    native
        || value
            .attr("role")
            .is_some_and(|role| role.trim().eq_ignore_ascii_case("button"))
}

fn cta_label(el: ElementRef<'_>) -> Option<String> {
    let value = el.value();
    if value.name() == "input" {
        return value.attr("value").and_then(text_or_none);
    }
    text_or_none(&el.text().collect::<String>()).or_else(|| value.attr("aria-label").and_then(text_or_none))
}

fn page_title(document: &Html) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector("title")?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>())))
}

fn meta_description(document: &Html) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector("meta[name]")?;
    Ok(document
        .select(&sel)
        .find(|meta| {
            meta.value()
                .attr("name")
                .is_some_and(|name| name.trim().eq_ignore_ascii_case("description"))
        })
        .and_then(|meta| meta.value().attr("content"))
        .and_then(text_or_none))
}

/// Currency symbol immediately followed by an amount, e.g. `$49` or `€1,299.99`.
pub fn scan_price_points(text: &str, symbols: &[char]) -> Vec<String> {
    let chars = text.chars().collect::<Vec<_>>();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if symbols.contains(&chars[i]) {
            let mut amount = String::new();
            let mut j = i + 1;
            while j < chars.len() {
                let ch = chars[j];
                let separator = (ch == ',' || ch == '.')
                    && !amount.is_empty()
                    && chars.get(j + 1).is_some_and(|next| next.is_ascii_digit());
                if ch.is_ascii_digit() || separator {
                    amount.push(ch);
                    j += 1;
                } else {
                    break;
                }
            }
            if !amount.is_empty() {
                out.push(format!("{}{}", chars[i], amount));
                i = j;
                continue;
            }
        }
        i += 1;
    }
    out
}

/// On-disk page capture used for offline runs and golden tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFixture {
    pub domain: String,
    pub url: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub body_path: Option<String>,
    #[serde(default)]
    pub inline_body: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PageFixture {
    pub fn to_page_fetch(&self) -> PageFetch {
        match (&self.error, &self.inline_body) {
            (None, Some(body)) => PageFetch::succeeded(
                self.domain.clone(),
                self.url.clone(),
                self.status.unwrap_or(200),
                body.clone(),
                Duration::from_millis(self.elapsed_ms.unwrap_or_default()),
                self.fetched_at,
            ),
            (error, _) => PageFetch::failed(
                self.domain.clone(),
                self.url.clone(),
                error
                    .clone()
                    .unwrap_or_else(|| "fixture has no page body".to_string()),
                self.fetched_at,
            ),
        }
    }
}

pub fn load_page_fixture(path: impl AsRef<Path>) -> Result<PageFixture> {
    let path = path.as_ref();
    let mut fixture: PageFixture = read_json_file(path)?;
    hydrate_fixture_body(path, &mut fixture)?;
    Ok(fixture)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_fixture_body(fixture_path: &Path, fixture: &mut PageFixture) -> Result<()> {
    if fixture.inline_body.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &fixture.body_path else {
        return Ok(());
    };
    let body_path = fixture_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    if !body_path.exists() {
        return Ok(());
    }
    let body = fs::read_to_string(&body_path)
        .with_context(|| format!("reading fixture page body {}", body_path.display()))?;
    fixture.inline_body = Some(body);
    Ok(())
}

/// Serves pages from `<root>/<domain>/fixture.json` instead of the network.
#[derive(Debug, Clone)]
pub struct FixturePageSource {
    root: PathBuf,
}

impl FixturePageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, domain: &str) -> PathBuf {
        self.root.join(domain_slug(domain)).join("fixture.json")
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    async fn fetch_page(&self, domain: &str) -> PageFetch {
        let path = self.fixture_path(domain);
        match load_page_fixture(&path) {
            Ok(fixture) => fixture.to_page_fetch(),
            Err(err) => {
                warn!(domain, path = %path.display(), error = %err, "fixture page unavailable");
                PageFetch::failed(domain, path.display().to_string(), format!("{err:#}"), Utc::now())
            }
        }
    }
}
