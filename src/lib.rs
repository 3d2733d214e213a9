//! A context-anchored fuzzy patch matcher and applier.
//!
//! `hunkmatch` applies a single edit, expressed as a context-anchored hunk
//! (the "before" lines to locate, and the "after" lines to put in their
//! place), to a source file. Unlike the standard `patch` command it carries
//! no line numbers at all: it finds the right location by searching for the
//! hunk's context, tolerating the cosmetic drift that accumulates between
//! the moment a hunk is authored and the moment it is applied: different
//! whitespace, statements joined with `;` instead of split across lines,
//! comments inserted or reworded.
//!
//! Tolerance is deliberately bounded. When drift makes two distinct regions
//! equally plausible anchors, `hunkmatch` refuses to guess and returns a
//! structured [`Rejection`] instead, because silently picking the wrong
//! location corrupts the file. A rejected hunk leaves the original text
//! untouched and can be retried or reported without risk.
//!
//! ## Getting Started
//!
//! The common path is: parse a textual hunk, then apply it to a string.
//!
//! ```rust
//! use hunkmatch::{parse_hunk, apply_hunk, MatchOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let original = "fn main() {\n    println!(\"hello\");\n}\n";
//!
//! // A headerless unified-style hunk: ' ' context, '-' removed, '+' added.
//! let hunk = parse_hunk(concat!(
//!     " fn main() {\n",
//!     "-    println!(\"hello\");\n",
//!     "+    println!(\"hello, hunkmatch!\");\n",
//!     " }",
//! ))?;
//!
//! let patched = apply_hunk(original, &hunk, &MatchOptions::default())?;
//! assert_eq!(patched, "fn main() {\n    println!(\"hello, hunkmatch!\");\n}\n");
//! # Ok(())
//! # }
//! ```
//!
//! ## The Pipeline
//!
//! Application is a pure, synchronous pipeline over immutable inputs:
//!
//! 1. **Normalization** ([`normalize_lines`]) canonicalizes each line for
//!    comparison: whitespace collapses to token boundaries, a trailing
//!    inline comment is dropped, and `;`-joined statements split into
//!    pseudo-lines so that one-per-line and joined-on-one-line forms of the
//!    same code compare equal. The stored file content is never altered.
//! 2. **Scoring** ([`line_similarity`], [`window_score`]) rates candidate
//!    windows with a token-level edit ratio, with a bounded line slack that
//!    absorbs a stray blank or comment line at zero contribution.
//! 3. **Locating** ([`locate_anchor`]) slides the hunk's context over the
//!    file, collects every window at or above the acceptance threshold, and
//!    resolves a single anchor, or rejects with [`Rejection::NoMatch`] or
//!    [`Rejection::AmbiguousMatch`]. There is no first-occurrence
//!    tie-break: a tied maximum is always a refusal.
//! 4. **Applying** ([`apply_anchor`]) splices the "after" lines over the
//!    anchored range, rebasing their indentation onto the file's own, and
//!    preserving the file's line-terminator and trailing-newline
//!    conventions. Every line outside the range is untouched. This stage is
//!    total; all failure lives in the locator.
//!
//! ## Refusing Ambiguity
//!
//! ```rust
//! use hunkmatch::{parse_hunk, apply_hunk, MatchOptions, Rejection};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Two identical regions: the hunk context matches both equally well.
//! let original = "start();\nreset();\nstart();\nreset();\n";
//! let hunk = parse_hunk("-start();\n+start_all();")?;
//!
//! let err = apply_hunk(original, &hunk, &MatchOptions::default()).unwrap_err();
//! assert!(matches!(err, Rejection::AmbiguousMatch(_)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! ### `parallel`
//!
//! - **Enabled by default.**
//! - Scores candidate windows in parallel with
//!   [`rayon`](https://crates.io/crates/rayon) during the fuzzy scan, which
//!   is the only computationally heavy part of the pipeline. Disable the
//!   feature with `default-features = false` for single-threaded targets.
use log::{debug, trace, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Scores within this distance are considered equal, both for the tie
/// check and for the threshold cutoff. Wide enough to swallow the f32 to
/// f64 conversion gap when a window lands exactly on the threshold.
const SCORE_EPSILON: f64 = 1e-6;

// --- Error Types ---

/// Represents errors that can occur while parsing a textual hunk.
#[derive(Error, Debug, PartialEq)]
pub enum HunkParseError {
    /// The hunk text contained no context, removal, addition, or marker
    /// lines at all.
    #[error("Hunk text contains no content lines")]
    EmptyHunk,
}

/// The reason a hunk was refused rather than applied.
///
/// Rejections are ordinary values, never panics. On any rejection the
/// original text is left untouched, so a refused hunk can be safely retried
/// or escalated to a human.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    /// No window scored at or above the acceptance threshold; the hunk's
    /// context does not correspond to anything in the file.
    #[error("No match: best window scored {best_score:.3}, below threshold {threshold:.2}")]
    NoMatch {
        /// The score of the best window seen, even though it did not qualify.
        best_score: f64,
        /// The threshold that was in effect.
        threshold: f32,
    },
    /// Two or more windows tied at the maximum qualifying score. Resolving
    /// arbitrarily is disallowed: applying the edit to the wrong location
    /// corrupts the file.
    #[error("Ambiguous match: {0:?} tied at the top score")]
    AmbiguousMatch(Vec<(usize, usize)>),
    /// The hunk itself is unusable: both sides empty, or a pure insertion
    /// with no marker line to anchor on.
    #[error("Malformed hunk: {0}")]
    MalformedHunk(&'static str),
}

/// Errors raised while loading acceptance fixtures from disk.
#[derive(Error, Debug)]
pub enum FixtureError {
    /// The fixture directory has no `original.<ext>` file.
    #[error("Fixture '{}' has no original.<ext> file", .0.display())]
    MissingOriginal(PathBuf),
    /// The fixture directory has no `hunk` file.
    #[error("Fixture '{}' has no hunk file", .0.display())]
    MissingHunk(PathBuf),
    /// A `pass/` fixture has no `expected.<ext>` file to compare against.
    #[error("Pass fixture '{}' has no expected.<ext> file", .0.display())]
    MissingExpected(PathBuf),
    /// The fixture's hunk file could not be parsed.
    #[error("Fixture '{}' has an invalid hunk file: {source}", .dir.display())]
    Hunk {
        dir: PathBuf,
        #[source]
        source: HunkParseError,
    },
    /// An I/O error occurred while reading fixture files.
    #[error("I/O error while reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// --- Options ---

/// Tunable state for the anchor locator.
///
/// The acceptance threshold is explicit configuration, not a hidden
/// constant: callers that need stricter or looser matching pass their own
/// values.
#[derive(Debug, Clone, Copy)]
pub struct MatchOptions {
    /// Minimum mean similarity, in `[0.0, 1.0]`, for a window to qualify as
    /// an anchor candidate. Higher is stricter.
    pub threshold: f32,
    /// Maximum number of inserted or removed lines absorbed inside an
    /// otherwise-matching window. Skipped lines contribute a score of zero,
    /// so slack penalizes drift rather than ignoring it.
    pub slack_lines: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            slack_lines: 1,
        }
    }
}

impl MatchOptions {
    /// Creates a new builder for `MatchOptions`.
    ///
    /// # Example
    ///
    /// ```
    /// # use hunkmatch::MatchOptions;
    /// let options = MatchOptions::builder()
    ///     .threshold(0.9)
    ///     .slack_lines(0)
    ///     .build();
    ///
    /// assert_eq!(options.threshold, 0.9);
    /// assert_eq!(options.slack_lines, 0);
    /// ```
    pub fn builder() -> MatchOptionsBuilder {
        MatchOptionsBuilder::default()
    }
}

/// A builder for creating [`MatchOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptionsBuilder {
    threshold: Option<f32>,
    slack_lines: Option<usize>,
}

impl MatchOptionsBuilder {
    /// Sets the minimum mean similarity for a window to qualify.
    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Sets the maximum absorbed insertion/deletion within a window.
    pub fn slack_lines(mut self, slack_lines: usize) -> Self {
        self.slack_lines = Some(slack_lines);
        self
    }

    /// Builds the `MatchOptions`.
    pub fn build(self) -> MatchOptions {
        let default = MatchOptions::default();
        MatchOptions {
            threshold: self.threshold.unwrap_or(default.threshold),
            slack_lines: self.slack_lines.unwrap_or(default.slack_lines),
        }
    }
}

// --- Data Structures ---

/// A context-anchored edit descriptor.
///
/// The `before` lines locate the edit point in the target file; the `after`
/// lines are the replacement content. A pure insertion has an empty
/// `before` and anchors on [`insert_after`](Self::insert_after) instead; a
/// pure deletion has an empty `after`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hunk {
    /// The context lines used to locate the edit point.
    pub before: Vec<String>,
    /// The replacement content.
    pub after: Vec<String>,
    /// For pure insertions: the marker line after which the `after` lines
    /// are inserted. Located under the same scoring and ambiguity rules as
    /// a one-line context window.
    pub insert_after: Option<String>,
}

impl Hunk {
    /// Returns `true` if this hunk is a pure insertion (empty `before`).
    pub fn is_insertion(&self) -> bool {
        self.before.is_empty()
    }

    /// Returns `true` if this hunk is a pure deletion (empty `after`).
    pub fn is_deletion(&self) -> bool {
        self.after.is_empty() && !self.before.is_empty()
    }

    /// Checks that the hunk is well-formed enough to be located.
    ///
    /// # Example
    ///
    /// ```
    /// # use hunkmatch::{Hunk, Rejection};
    /// let empty = Hunk::default();
    /// assert!(matches!(empty.validate(), Err(Rejection::MalformedHunk(_))));
    /// ```
    pub fn validate(&self) -> Result<(), Rejection> {
        if self.before.is_empty() && self.after.is_empty() {
            return Err(Rejection::MalformedHunk(
                "'before' and 'after' are both empty",
            ));
        }
        if self.before.is_empty() && self.insert_after.is_none() {
            return Err(Rejection::MalformedHunk(
                "pure insertion without a marker line",
            ));
        }
        Ok(())
    }
}

/// A canonical comparison view of one logical statement.
///
/// Normalization may split a physical line into several pseudo-lines (one
/// per `;`-separated statement); each keeps a back-reference to the raw
/// line it came from so that matches can be mapped to physical line ranges
/// for re-insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedLine {
    /// The canonical tokens of this pseudo-line. Empty for a blank line.
    pub tokens: Vec<String>,
    /// The 0-based index of the originating raw line.
    pub raw_index: usize,
}

/// A contiguous raw-line range paired with its similarity score.
///
/// Candidates are transient: the locator creates them while scanning and
/// discards all but the resolved one.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorCandidate {
    /// 0-based start of the half-open raw line range.
    pub start_line: usize,
    /// 0-based exclusive end of the raw line range.
    pub end_line: usize,
    /// Window similarity in `[0.0, 1.0]`.
    pub score: f64,
}

/// The single anchor chosen as the application point.
///
/// For a pure insertion `start_line == end_line`: the `after` lines are
/// inserted at that position and nothing is replaced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedAnchor {
    /// 0-based start of the half-open raw line range to replace.
    pub start_line: usize,
    /// 0-based exclusive end of the raw line range to replace.
    pub end_line: usize,
    /// The similarity score of the winning window.
    pub score: f64,
}

impl std::fmt::Display for ResolvedAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 1-based for user-facing messages.
        write!(
            f,
            "lines {}..{} (score {:.3})",
            self.start_line + 1,
            self.end_line,
            self.score
        )
    }
}

// --- Hunk Parsing ---

/// Parses a headerless unified-style hunk block into a [`Hunk`].
///
/// Recognized line forms:
///
/// - `' '` prefix: context line, part of both `before` and `after`;
/// - `'-'` prefix: removed line, part of `before` only;
/// - `'+'` prefix: added line, part of `after` only;
/// - `@after: <marker>`: insertion marker for pure-insertion hunks;
/// - an empty line: a blank context line;
/// - anything else: treated leniently as a context line, since hunks
///   pasted through chat tools routinely lose their leading space.
///
/// # Errors
///
/// Returns [`HunkParseError::EmptyHunk`] when no content line was found.
///
/// # Example
///
/// ```
/// # use hunkmatch::parse_hunk;
/// let hunk = parse_hunk(" keep\n-old\n+new").unwrap();
/// assert_eq!(hunk.before, vec!["keep", "old"]);
/// assert_eq!(hunk.after, vec!["keep", "new"]);
/// ```
pub fn parse_hunk(text: &str) -> Result<Hunk, HunkParseError> {
    let mut hunk = Hunk::default();
    let mut saw_content = false;

    for line in text.lines() {
        if let Some(marker) = line.strip_prefix("@after:") {
            hunk.insert_after = Some(marker.trim().to_string());
            saw_content = true;
        } else if let Some(added) = line.strip_prefix('+') {
            hunk.after.push(added.to_string());
            saw_content = true;
        } else if let Some(removed) = line.strip_prefix('-') {
            hunk.before.push(removed.to_string());
            saw_content = true;
        } else if let Some(context) = line.strip_prefix(' ') {
            hunk.before.push(context.to_string());
            hunk.after.push(context.to_string());
            saw_content = true;
        } else if line.is_empty() {
            // A blank context line whose leading space was trimmed away.
            hunk.before.push(String::new());
            hunk.after.push(String::new());
        } else {
            // Lenient: a context line that lost its leading space.
            hunk.before.push(line.to_string());
            hunk.after.push(line.to_string());
            saw_content = true;
        }
    }

    if !saw_content {
        return Err(HunkParseError::EmptyHunk);
    }
    Ok(hunk)
}

// --- Line Normalizer ---

/// Drops a trailing inline comment (`//` or `#`) from a line.
///
/// A comment-only line is returned whole: its presence or absence is
/// exactly the drift the locator must weigh, so it stays comparable
/// content.
fn strip_inline_comment(line: &str) -> &str {
    let mut cut: Option<usize> = None;
    for marker in ["//", "#"] {
        if let Some(pos) = line.find(marker) {
            // Only strip when real content precedes the marker; a line that
            // *is* a comment stays intact.
            if !line[..pos].trim().is_empty() {
                cut = Some(cut.map_or(pos, |c| c.min(pos)));
            }
        }
    }
    match cut {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Normalizes one raw line into canonical pseudo-lines of tokens.
///
/// Horizontal whitespace collapses to token boundaries, a trailing inline
/// comment is stripped, and `;`-joined statements split into independent
/// pseudo-lines. A blank (or separators-only) line yields a single
/// empty-token pseudo-line. The function is pure and idempotent in token
/// content.
///
/// # Example
///
/// ```
/// # use hunkmatch::normalize_line;
/// let pseudo = normalize_line("let a = 1; let b = 2; // note");
/// assert_eq!(pseudo.len(), 2);
/// assert_eq!(pseudo[0], vec!["let", "a", "=", "1"]);
/// assert_eq!(pseudo[1], vec!["let", "b", "=", "2"]);
/// ```
pub fn normalize_line(raw: &str) -> Vec<Vec<String>> {
    let content = strip_inline_comment(raw);

    let mut pseudo: Vec<Vec<String>> = content
        .split(';')
        .filter(|segment| !segment.trim().is_empty())
        .map(|segment| segment.split_whitespace().map(String::from).collect())
        .collect();

    if pseudo.is_empty() {
        // Blank lines (and lines that were only separators) still occupy
        // one comparison slot.
        pseudo.push(Vec::new());
    }
    pseudo
}

/// Normalizes a slice of raw lines, keeping the raw-line back-reference on
/// every pseudo-line.
pub fn normalize_lines<T: AsRef<str>>(lines: &[T]) -> Vec<NormalizedLine> {
    let mut normalized = Vec::with_capacity(lines.len());
    for (raw_index, line) in lines.iter().enumerate() {
        for tokens in normalize_line(line.as_ref()) {
            normalized.push(NormalizedLine { tokens, raw_index });
        }
    }
    normalized
}

// --- Similarity Scorer ---

/// Computes the token-level similarity of two normalized pseudo-lines.
///
/// Identical content scores 1.0; two blank lines score 1.0; a blank line
/// against content scores 0.0. Everything in between is the `similar`
/// edit ratio over the token sequences.
pub fn line_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a_refs: Vec<&str> = a.iter().map(String::as_str).collect();
    let b_refs: Vec<&str> = b.iter().map(String::as_str).collect();
    f64::from(similar::TextDiff::from_slices(&a_refs, &b_refs).ratio())
}

/// Scores a candidate window against the hunk's context.
///
/// Alignment is positional with up to `slack_lines` of offset in either
/// direction. A line skipped via slack contributes 0 (penalized,
/// not excluded) and the sum is normalized by the longer of the two
/// sequences, so tolerance never becomes unbounded permissiveness. With
/// zero slack and equal lengths this is the plain arithmetic mean of the
/// per-line similarities.
pub fn window_score(
    context: &[NormalizedLine],
    window: &[NormalizedLine],
    slack_lines: usize,
) -> f64 {
    let c = context.len();
    let w = window.len();
    if c == 0 && w == 0 {
        return 1.0;
    }
    if c == 0 || w == 0 {
        return 0.0;
    }
    if c.abs_diff(w) > slack_lines {
        return 0.0;
    }

    // Banded alignment: dp[i][j] is the best score sum for context[..i]
    // against window[..j]; skips (off-diagonal moves) add nothing.
    let band = slack_lines.max(c.abs_diff(w));
    let mut dp = vec![vec![f64::NEG_INFINITY; w + 1]; c + 1];
    dp[0][0] = 0.0;
    for i in 0..=c {
        for j in 0..=w {
            if i.abs_diff(j) > band {
                continue;
            }
            let mut best = dp[i][j];
            if i > 0 && j > 0 {
                let pair = dp[i - 1][j - 1]
                    + line_similarity(&context[i - 1].tokens, &window[j - 1].tokens);
                best = best.max(pair);
            }
            if i > 0 {
                best = best.max(dp[i - 1][j]);
            }
            if j > 0 {
                best = best.max(dp[i][j - 1]);
            }
            dp[i][j] = best;
        }
    }

    let total = dp[c][w];
    if total.is_finite() {
        total / c.max(w) as f64
    } else {
        0.0
    }
}

// --- Anchor Locator ---

/// A strategy for resolving a hunk's anchor in a target file.
///
/// The built-in [`DefaultAnchorFinder`] covers the exact and fuzzy search;
/// the trait keeps the search pluggable for callers with their own notion
/// of context.
pub trait AnchorFinder {
    /// Resolves the single anchor for `hunk` in `target_lines`, or refuses.
    fn locate<T: AsRef<str> + Sync>(
        &self,
        hunk: &Hunk,
        target_lines: &[T],
    ) -> Result<ResolvedAnchor, Rejection>;
}

/// The built-in two-stage anchor search.
///
/// Stage one ranks leniently: every window whose normalized similarity
/// reaches the threshold becomes a candidate. Stage two selects strictly:
/// only a unique maximum is accepted; a tied maximum is an
/// [`Rejection::AmbiguousMatch`]. An exact pre-pass on the normalized
/// pseudo-lines short-circuits the common case.
#[derive(Debug)]
pub struct DefaultAnchorFinder<'a> {
    options: &'a MatchOptions,
}

/// A scoring window over the file's pseudo-lines, aligned to physical line
/// boundaries so a joined statement is never half-consumed.
#[derive(Debug, Clone, Copy)]
struct PseudoWindow {
    start: usize,
    len: usize,
}

impl<'a> DefaultAnchorFinder<'a> {
    /// Creates a new finder with the given options.
    pub fn new(options: &'a MatchOptions) -> Self {
        Self { options }
    }

    /// Enumerates candidate windows of pseudo-line lengths in
    /// `[min_len, max_len]` that start and end on physical line boundaries.
    fn boundary_windows(
        file: &[NormalizedLine],
        min_len: usize,
        max_len: usize,
    ) -> Vec<PseudoWindow> {
        let n = file.len();
        let mut windows = Vec::new();
        for start in 0..n {
            let starts_line = start == 0 || file[start].raw_index != file[start - 1].raw_index;
            if !starts_line {
                continue;
            }
            for len in min_len.max(1)..=max_len {
                let end = start + len;
                if end > n {
                    break;
                }
                let ends_line = end == n || file[end].raw_index != file[end - 1].raw_index;
                if ends_line {
                    windows.push(PseudoWindow { start, len });
                }
            }
        }
        windows
    }

    /// Maps a pseudo-line window back onto its half-open raw line range.
    fn raw_range(file: &[NormalizedLine], window: PseudoWindow) -> (usize, usize) {
        let start_line = file[window.start].raw_index;
        let end_line = file[window.start + window.len - 1].raw_index + 1;
        (start_line, end_line)
    }

    /// Resolves the candidate set to a single anchor, or refuses.
    ///
    /// Zero candidates is a [`Rejection::NoMatch`]; a tied maximum is a
    /// [`Rejection::AmbiguousMatch`]. There is deliberately no
    /// first-occurrence tie-break.
    fn select_unique(
        candidates: Vec<AnchorCandidate>,
        best_seen: f64,
        threshold: f32,
    ) -> Result<ResolvedAnchor, Rejection> {
        if candidates.is_empty() {
            debug!(
                "    No window reached the threshold (best {:.3} < {:.2}).",
                best_seen, threshold
            );
            return Err(Rejection::NoMatch {
                best_score: best_seen.max(0.0),
                threshold,
            });
        }

        let top = candidates
            .iter()
            .map(|cand| cand.score)
            .fold(f64::NEG_INFINITY, f64::max);
        let tied: Vec<&AnchorCandidate> = candidates
            .iter()
            .filter(|cand| (top - cand.score).abs() < SCORE_EPSILON)
            .collect();

        if tied.len() > 1 {
            let ranges: Vec<(usize, usize)> = tied
                .iter()
                .map(|cand| (cand.start_line, cand.end_line))
                .collect();
            warn!(
                "    Ambiguous match: {} windows tied at score {:.3}: {:?}. Refusing.",
                ranges.len(),
                top,
                ranges
            );
            return Err(Rejection::AmbiguousMatch(ranges));
        }

        let winner = tied[0];
        debug!(
            "    Resolved anchor at lines {}..{} with score {:.3}.",
            winner.start_line, winner.end_line, winner.score
        );
        Ok(ResolvedAnchor {
            start_line: winner.start_line,
            end_line: winner.end_line,
            score: winner.score,
        })
    }

    /// Scores every boundary-aligned window of the requested lengths and
    /// collects the qualifying candidates, deduplicated by raw range.
    ///
    /// Returns the candidate set and the best score seen anywhere, which
    /// feeds the `NoMatch` diagnostics.
    fn scan(
        &self,
        context: &[NormalizedLine],
        file: &[NormalizedLine],
        min_len: usize,
        max_len: usize,
    ) -> (Vec<AnchorCandidate>, f64) {
        let windows = Self::boundary_windows(file, min_len, max_len);
        trace!(
            "    Scoring {} boundary-aligned windows (lengths {}..={}).",
            windows.len(),
            min_len.max(1),
            max_len
        );
        let slack = self.options.slack_lines;

        #[cfg(feature = "parallel")]
        let scored: Vec<(PseudoWindow, f64)> = windows
            .par_iter()
            .map(|&window| {
                let slice = &file[window.start..window.start + window.len];
                (window, window_score(context, slice, slack))
            })
            .collect();

        #[cfg(not(feature = "parallel"))]
        let scored: Vec<(PseudoWindow, f64)> = windows
            .iter()
            .map(|&window| {
                let slice = &file[window.start..window.start + window.len];
                (window, window_score(context, slice, slack))
            })
            .collect();

        let mut best_seen = 0.0_f64;
        // Several pseudo windows can cover the same physical range (joined
        // statements); keep only the best score per range.
        let mut by_range: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for (window, score) in scored {
            best_seen = best_seen.max(score);
            if score >= f64::from(self.options.threshold) - SCORE_EPSILON {
                let range = Self::raw_range(file, window);
                let entry = by_range.entry(range).or_insert(score);
                if score > *entry {
                    *entry = score;
                }
            }
        }

        let candidates = by_range
            .into_iter()
            .map(|((start_line, end_line), score)| AnchorCandidate {
                start_line,
                end_line,
                score,
            })
            .collect();
        (candidates, best_seen)
    }

    /// Locates a replacement anchor from the hunk's "before" context.
    fn locate_context(
        &self,
        before: &[String],
        file: &[NormalizedLine],
    ) -> Result<ResolvedAnchor, Rejection> {
        let context = normalize_lines(before);
        let c = context.len();
        trace!(
            "  Locating context of {} pseudo-lines in {} file pseudo-lines.",
            c,
            file.len()
        );

        // Exact pre-pass: cheap, and still subject to the uniqueness rule.
        let exact: Vec<PseudoWindow> = Self::boundary_windows(file, c, c)
            .into_iter()
            .filter(|window| {
                file[window.start..window.start + window.len]
                    .iter()
                    .zip(&context)
                    .all(|(a, b)| a.tokens == b.tokens)
            })
            .collect();
        if !exact.is_empty() {
            debug!("    Found {} exact normalized match(es).", exact.len());
            let candidates = exact
                .into_iter()
                .map(|window| {
                    let (start_line, end_line) = Self::raw_range(file, window);
                    AnchorCandidate {
                        start_line,
                        end_line,
                        score: 1.0,
                    }
                })
                .collect();
            return Self::select_unique(candidates, 1.0, self.options.threshold);
        }

        // Fuzzy scan with the slack-widened window lengths.
        let slack = self.options.slack_lines;
        let min_len = c.saturating_sub(slack).max(1);
        let max_len = c + slack;
        let (candidates, best_seen) = self.scan(&context, file, min_len, max_len);
        Self::select_unique(candidates, best_seen, self.options.threshold)
    }

    /// Locates an insertion point from the hunk's marker line.
    ///
    /// The marker is matched like a one-line context window; the resolved
    /// anchor is the empty range immediately after the matched lines.
    fn locate_insertion(
        &self,
        marker: &str,
        file: &[NormalizedLine],
    ) -> Result<ResolvedAnchor, Rejection> {
        let context = normalize_lines(&[marker]);
        trace!("  Locating insertion marker '{}'.", marker.trim());
        let len = context.len();
        let (candidates, best_seen) = self.scan(&context, file, len, len);
        let anchor = Self::select_unique(candidates, best_seen, self.options.threshold)?;
        Ok(ResolvedAnchor {
            start_line: anchor.end_line,
            end_line: anchor.end_line,
            score: anchor.score,
        })
    }
}

impl<'a> AnchorFinder for DefaultAnchorFinder<'a> {
    fn locate<T: AsRef<str> + Sync>(
        &self,
        hunk: &Hunk,
        target_lines: &[T],
    ) -> Result<ResolvedAnchor, Rejection> {
        hunk.validate()?;
        let file = normalize_lines(target_lines);

        if hunk.is_insertion() {
            // `validate` guarantees the marker is present here.
            let marker = hunk.insert_after.as_deref().ok_or(Rejection::MalformedHunk(
                "pure insertion without a marker line",
            ))?;
            self.locate_insertion(marker, &file)
        } else {
            self.locate_context(&hunk.before, &file)
        }
    }
}

/// Locates the anchor for a hunk in a text without modifying anything.
///
/// This is the read-only core of the pipeline: normalization, scoring, and
/// the strict uniqueness check, with all failure expressed as a
/// [`Rejection`].
///
/// # Example
///
/// ```rust
/// # use hunkmatch::{parse_hunk, locate_anchor, MatchOptions};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let original = "alpha\nbeta\ngamma\n";
/// let hunk = parse_hunk(" alpha\n-beta\n+BETA\n gamma")?;
///
/// let anchor = locate_anchor(original, &hunk, &MatchOptions::default())?;
/// assert_eq!((anchor.start_line, anchor.end_line), (0, 3));
/// assert_eq!(anchor.score, 1.0);
/// # Ok(())
/// # }
/// ```
pub fn locate_anchor(
    original: &str,
    hunk: &Hunk,
    options: &MatchOptions,
) -> Result<ResolvedAnchor, Rejection> {
    let lines = split_raw_lines(original);
    locate_anchor_in_lines(hunk, &lines, options)
}

/// Locates the anchor for a hunk in a slice of lines.
///
/// An allocation-friendlier variant of [`locate_anchor`] for callers that
/// already hold line-based content.
pub fn locate_anchor_in_lines<T: AsRef<str> + Sync>(
    hunk: &Hunk,
    target_lines: &[T],
    options: &MatchOptions,
) -> Result<ResolvedAnchor, Rejection> {
    let finder = DefaultAnchorFinder::new(options);
    finder.locate(hunk, target_lines)
}

// --- Patch Applier ---

/// Splits a text into raw lines without terminators, tolerating CRLF.
fn split_raw_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();
    if text.ends_with('\n') {
        lines.pop();
    }
    lines
}

/// Returns the leading horizontal whitespace of a line.
fn leading_whitespace(line: &str) -> &str {
    let end = line
        .find(|ch: char| !ch.is_whitespace())
        .unwrap_or(line.len());
    &line[..end]
}

/// Replaces the anchored raw-line range with the hunk's "after" lines.
///
/// The inserted block is re-indented by literal prefix substitution: the
/// indentation of the first replaced line (or, for a pure insertion, of
/// the line the anchor follows) replaces the block's own base indentation,
/// so relative depth inside the block survives while the surrounding
/// file's visual style wins. Lines outside the anchor range are emitted
/// byte-for-byte, and the file's line-terminator and trailing-newline
/// conventions are preserved.
///
/// This operation is deterministic and total: given a [`ResolvedAnchor`]
/// it cannot fail. All failure is pushed earlier, into the locator.
///
/// # Example
///
/// ```rust
/// # use hunkmatch::{apply_anchor, ResolvedAnchor};
/// let original = "    first\n    second\n    third\n";
/// let anchor = ResolvedAnchor { start_line: 1, end_line: 2, score: 1.0 };
/// let after = vec!["replacement".to_string()];
///
/// let patched = apply_anchor(original, &anchor, &after);
/// assert_eq!(patched, "    first\n    replacement\n    third\n");
/// ```
pub fn apply_anchor(original: &str, anchor: &ResolvedAnchor, after: &[String]) -> String {
    let eol = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let had_trailing_newline = original.ends_with('\n');
    let lines = split_raw_lines(original);

    let start = anchor.start_line.min(lines.len());
    let end = anchor.end_line.clamp(start, lines.len());

    // Indentation source: the first replaced line, or the preceding line
    // for a pure insertion at an empty range.
    let indent_source = if start < end {
        lines.get(start).copied()
    } else if start > 0 {
        lines.get(start - 1).copied()
    } else {
        None
    };
    let target_indent = indent_source.map(leading_whitespace).unwrap_or("");
    let base_indent = after
        .iter()
        .find(|line| !line.trim().is_empty())
        .map(|line| leading_whitespace(line))
        .unwrap_or("");

    let mut patched: Vec<String> = Vec::with_capacity(lines.len() + after.len());
    patched.extend(lines[..start].iter().map(|line| (*line).to_string()));
    for line in after {
        if line.trim().is_empty() {
            patched.push(String::new());
        } else if let Some(rest) = line.strip_prefix(base_indent) {
            patched.push(format!("{}{}", target_indent, rest));
        } else {
            // The block is not uniformly indented; keep the line as
            // authored rather than inventing structure.
            patched.push(line.clone());
        }
    }
    patched.extend(lines[end..].iter().map(|line| (*line).to_string()));

    let mut text = patched.join(eol);
    if !text.is_empty() && (had_trailing_newline || lines.is_empty()) {
        text.push_str(eol);
    }
    text
}

/// Applies a single hunk to a text, returning the transformed text or a
/// structured [`Rejection`].
///
/// The pipeline never partially applies: on any rejection the caller's
/// original text is untouched. Repeated invocations with the same inputs
/// produce identical output.
///
/// # Example
///
/// ```rust
/// # use hunkmatch::{parse_hunk, apply_hunk, MatchOptions};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let original = "alpha\nbeta\ngamma\n";
/// let hunk = parse_hunk(" alpha\n-beta\n+BETA\n gamma")?;
///
/// let patched = apply_hunk(original, &hunk, &MatchOptions::default())?;
/// assert_eq!(patched, "alpha\nBETA\ngamma\n");
/// # Ok(())
/// # }
/// ```
pub fn apply_hunk(
    original: &str,
    hunk: &Hunk,
    options: &MatchOptions,
) -> Result<String, Rejection> {
    hunk.validate()?;
    let anchor = locate_anchor(original, hunk, options)?;
    debug!("  Applying hunk at {}.", anchor);
    Ok(apply_anchor(original, &anchor, &hunk.after))
}

// --- Fixture Harness Support ---

/// Whether a fixture documents an edit that must succeed or must be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureKind {
    /// The edit must apply and reproduce `expected.<ext>` byte-for-byte.
    Pass,
    /// The edit must be refused, or, when an `expected.<ext>` is present,
    /// may instead produce output that diverges from it, documenting a
    /// known-hard case.
    Fail,
}

impl std::fmt::Display for FixtureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixtureKind::Pass => write!(f, "pass"),
            FixtureKind::Fail => write!(f, "fail"),
        }
    }
}

/// One acceptance fixture, fully loaded into memory.
#[derive(Debug, Clone)]
pub struct FixtureCase {
    /// The fixture's name, e.g. `pass/context_matching`.
    pub name: String,
    /// Whether this fixture must succeed or must be refused.
    pub kind: FixtureKind,
    /// The original source text.
    pub original: String,
    /// The hunk to apply.
    pub hunk: Hunk,
    /// The expected output, when the fixture ships one.
    pub expected: Option<String>,
}

/// The verdict for one evaluated fixture.
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureReport {
    /// The fixture's name.
    pub name: String,
    /// `true` if the engine behaved as the fixture requires.
    pub passed: bool,
    /// A one-line human-readable explanation of the verdict.
    pub detail: String,
}

fn read_fixture_file(path: &Path) -> Result<String, FixtureError> {
    fs::read_to_string(path).map_err(|e| FixtureError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Finds the file in `dir` whose stem is `stem`, with any extension.
fn find_by_stem(dir: &Path, stem: &str) -> Result<Option<PathBuf>, FixtureError> {
    let entries = fs::read_dir(dir).map_err(|e| FixtureError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| FixtureError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        if path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some(stem) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Loads one fixture directory.
///
/// A fixture directory holds `original.<ext>`, a `hunk` file in the
/// [`parse_hunk`] format, and an `expected.<ext>` file (mandatory for
/// `pass/` fixtures, optional for `fail/`).
pub fn load_fixture(dir: &Path, kind: FixtureKind) -> Result<FixtureCase, FixtureError> {
    let original_path = find_by_stem(dir, "original")?
        .ok_or_else(|| FixtureError::MissingOriginal(dir.to_path_buf()))?;
    let original = read_fixture_file(&original_path)?;

    let hunk_path = dir.join("hunk");
    if !hunk_path.is_file() {
        return Err(FixtureError::MissingHunk(dir.to_path_buf()));
    }
    let hunk_text = read_fixture_file(&hunk_path)?;
    let hunk = parse_hunk(&hunk_text).map_err(|source| FixtureError::Hunk {
        dir: dir.to_path_buf(),
        source,
    })?;

    let expected = match find_by_stem(dir, "expected")? {
        Some(path) => Some(read_fixture_file(&path)?),
        None if kind == FixtureKind::Pass => {
            return Err(FixtureError::MissingExpected(dir.to_path_buf()));
        }
        None => None,
    };

    let name = dir
        .file_name()
        .map(|n| format!("{}/{}", kind, n.to_string_lossy()))
        .unwrap_or_else(|| kind.to_string());

    Ok(FixtureCase {
        name,
        kind,
        original,
        hunk,
        expected,
    })
}

/// Discovers every fixture under `root`, scanning the `pass/` and `fail/`
/// category directories. Fixtures are returned in name order so runs are
/// reproducible.
pub fn discover_fixtures(root: &Path) -> Result<Vec<FixtureCase>, FixtureError> {
    let mut cases = Vec::new();
    for (category, kind) in [("pass", FixtureKind::Pass), ("fail", FixtureKind::Fail)] {
        let dir = root.join(category);
        if !dir.is_dir() {
            continue;
        }
        let entries = fs::read_dir(&dir).map_err(|e| FixtureError::Io {
            path: dir.clone(),
            source: e,
        })?;
        let mut subdirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        subdirs.sort();
        for subdir in subdirs {
            cases.push(load_fixture(&subdir, kind)?);
        }
    }
    Ok(cases)
}

/// Evaluates one fixture against the core and renders a verdict.
///
/// For a `pass/` fixture the core must apply the hunk and reproduce the
/// expected text byte-for-byte. For a `fail/` fixture the core must refuse
/// the hunk; when the fixture ships an `expected.<ext>` despite being filed
/// under `fail/`, output that diverges from it also counts as correct;
/// the fixture then documents a known-hard case rather than a crash.
pub fn evaluate_fixture(case: &FixtureCase, options: &MatchOptions) -> FixtureReport {
    let outcome = apply_hunk(&case.original, &case.hunk, options);
    match case.kind {
        FixtureKind::Pass => match outcome {
            Ok(output) => {
                // Pass fixtures always carry an expected file; `load_fixture`
                // enforces it.
                let expected = case.expected.as_deref().unwrap_or_default();
                if output == expected {
                    FixtureReport {
                        name: case.name.clone(),
                        passed: true,
                        detail: "applied and matched expected output".to_string(),
                    }
                } else {
                    FixtureReport {
                        name: case.name.clone(),
                        passed: false,
                        detail: "applied but output diverges from expected".to_string(),
                    }
                }
            }
            Err(rejection) => FixtureReport {
                name: case.name.clone(),
                passed: false,
                detail: format!("rejected: {}", rejection),
            },
        },
        FixtureKind::Fail => match outcome {
            Err(rejection) => FixtureReport {
                name: case.name.clone(),
                passed: true,
                detail: format!("refused as required: {}", rejection),
            },
            Ok(output) => match &case.expected {
                Some(expected) if output != *expected => FixtureReport {
                    name: case.name.clone(),
                    passed: true,
                    detail: "applied with output diverging from expected (known-hard case)"
                        .to_string(),
                },
                Some(_) => FixtureReport {
                    name: case.name.clone(),
                    passed: false,
                    detail: "applied cleanly and reproduced expected; a refusal or divergence \
                             was required"
                        .to_string(),
                },
                None => FixtureReport {
                    name: case.name.clone(),
                    passed: false,
                    detail: "applied cleanly but a refusal was required".to_string(),
                },
            },
        },
    }
}
