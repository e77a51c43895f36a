//! Queryable tree view over org-mode documents.
//! Raw parsing produces an arena of nodes; `tree` wraps it with lazily derived
//! headings, tags, dates and contents; `projection` runs structural queries and
//! maps matches back to live nodes through their position in the tree.

pub mod core {
    use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{borrow::Borrow, fmt};

    use crate::xpath::XPathError;

    /* ------------------------------- IDs ------------------------------- */

    /// Index of a node inside a `RawDocument` arena.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeId(pub usize);

    impl NodeId {
        pub const ROOT: NodeId = NodeId(0);
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Tag wrapper; borrows as `str` so sets can be probed with plain strings.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl Borrow<str> for Tag {
        fn borrow(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// File-level `#+KEY: value` settings, keyed by the uppercased key.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct FileSettings {
        #[serde(default)]
        pub values: IndexMap<String, Vec<String>>,
    }

    impl FileSettings {
        pub fn push(&mut self, key: &str, value: &str) {
            self.values
                .entry(key.to_ascii_uppercase())
                .or_default()
                .push(value.to_string());
        }

        pub fn get(&self, key: &str) -> &[String] {
            self.values
                .get(&key.to_ascii_uppercase())
                .map(Vec::as_slice)
                .unwrap_or(&[])
        }

        /// Tags from every `#+FILETAGS:` value, split on `:`.
        pub fn file_tags(&self) -> Vec<Tag> {
            self.get("FILETAGS")
                .iter()
                .flat_map(|v| v.split(':'))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Tag::from)
                .collect()
        }
    }

    /* ------------------------------ Raw tree ------------------------------ */

    /// One node as produced by a raw parse adapter.
    ///
    /// The root's `heading` is empty and its `full_lines` hold the file preamble.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct RawNode {
        pub heading: String,
        /// Outline depth; 0 for the root.
        pub level: usize,
        pub todo: Option<String>,
        pub priority: Option<char>,
        /// Tags written on this heading line only.
        pub shallow_tags: Vec<Tag>,
        /// `:PROPERTIES:` drawer entries; empty when the node has no drawer.
        pub properties: IndexMap<String, String>,
        /// Body without the heading line, planning lines and property drawer.
        pub body_lines: Vec<String>,
        /// Heading line followed by the untouched body.
        pub full_lines: Vec<String>,
        pub children: Vec<NodeId>,
        pub parent: Option<NodeId>,
        pub root: bool,
    }

    impl RawNode {
        pub fn root() -> Self {
            Self {
                root: true,
                ..Self::default()
            }
        }

        pub fn is_root(&self) -> bool {
            self.root
        }
    }

    /// Arena of raw nodes; `NodeId::ROOT` is the document root and nodes are
    /// stored in document order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RawDocument {
        pub nodes: Vec<RawNode>,
        pub settings: FileSettings,
    }

    impl Default for RawDocument {
        fn default() -> Self {
            Self {
                nodes: vec![RawNode::root()],
                settings: FileSettings::default(),
            }
        }
    }

    impl RawDocument {
        pub fn node(&self, id: NodeId) -> &RawNode {
            &self.nodes[id.0]
        }

        pub fn root(&self) -> &RawNode {
            self.node(NodeId::ROOT)
        }
    }

    /* ------------------------------ Positions ------------------------------ */

    /// One step of a `PositionId`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Step {
        /// Index into `Org::children`.
        Child(usize),
        /// Index into `Org::contents`.
        Content(usize),
    }

    /// Location of a node, table or text fragment relative to the document root.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PositionId(pub Vec<Step>);

    impl PositionId {
        pub fn root() -> Self {
            Self(Vec::new())
        }

        pub fn steps(&self) -> &[Step] {
            &self.0
        }

        pub fn is_root(&self) -> bool {
            self.0.is_empty()
        }

        pub fn child(&self, index: usize) -> Self {
            self.extended(Step::Child(index))
        }

        pub fn content(&self, index: usize) -> Self {
            self.extended(Step::Content(index))
        }

        fn extended(&self, step: Step) -> Self {
            let mut steps = self.0.clone();
            steps.push(step);
            Self(steps)
        }
    }

    impl fmt::Display for PositionId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.0.is_empty() {
                return f.write_str("/");
            }
            for step in &self.0 {
                match step {
                    Step::Child(i) => write!(f, "/child[{i}]")?,
                    Step::Content(i) => write!(f, "/content[{i}]")?,
                }
            }
            Ok(())
        }
    }

    /* -------------------------------- Dates -------------------------------- */

    /// A creation timestamp; org allows both all-day dates and date-times.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum OrgDate {
        Date(NaiveDate),
        DateTime(NaiveDateTime),
    }

    impl OrgDate {
        pub fn date(&self) -> NaiveDate {
            match self {
                OrgDate::Date(d) => *d,
                OrgDate::DateTime(dt) => dt.date(),
            }
        }

        pub fn time(&self) -> Option<NaiveTime> {
            match self {
                OrgDate::Date(_) => None,
                OrgDate::DateTime(dt) => Some(dt.time()),
            }
        }

        /// All-day dates map to midnight.
        pub fn to_datetime(&self) -> NaiveDateTime {
            match self {
                OrgDate::Date(d) => d.and_time(NaiveTime::MIN),
                OrgDate::DateTime(dt) => *dt,
            }
        }

        pub fn year(&self) -> i32 {
            self.date().year()
        }
    }

    impl PartialEq<NaiveDateTime> for OrgDate {
        fn eq(&self, other: &NaiveDateTime) -> bool {
            matches!(self, OrgDate::DateTime(dt) if dt == other)
        }
    }

    impl PartialEq<NaiveDate> for OrgDate {
        fn eq(&self, other: &NaiveDate) -> bool {
            matches!(self, OrgDate::Date(d) if d == other)
        }
    }

    /// Inactive org timestamp syntax, e.g. `[2018-10-23 Tue 20:55]`.
    impl fmt::Display for OrgDate {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                OrgDate::Date(d) => write!(f, "[{}]", d.format("%Y-%m-%d %a")),
                OrgDate::DateTime(dt) if dt.second() != 0 => {
                    write!(f, "[{}]", dt.format("%Y-%m-%d %a %H:%M:%S"))
                }
                OrgDate::DateTime(dt) => write!(f, "[{}]", dt.format("%Y-%m-%d %a %H:%M")),
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum OrgError {
        #[error("bad date string {0:?}")]
        BadDateFormat(String),
        #[error("processing '{heading}' failed")]
        Node {
            heading: String,
            #[source]
            source: Box<OrgError>,
        },
        #[error("query {query:?} matched {count} nodes, expected exactly one")]
        AmbiguousOrUnmatchedQuery { query: String, count: usize },
        #[error(transparent)]
        Query(#[from] XPathError),
        #[error("query {query:?} matched a {kind} element, expected an org node")]
        NotANode { query: String, kind: String },
        #[error("matched <{element}> element carries no position")]
        Unresolvable { element: String },
        #[error("position {0} does not exist in this document")]
        InvalidPosition(PositionId),
        #[error("malformed position attribute")]
        PositionEncoding(#[from] serde_json::Error),
    }

}

pub mod parser {
    //! Raw parse adapter built on `nom`.
    //!
    //! Parsing strategy:
    //! - The scan is line-oriented; heading lines (`*`, `**`, ...) split the file into sections
    //!   and a stack of open nodes assigns each section its parent by level.
    //! - Lines before the first heading are the root preamble; `#+KEY: value` lines there
    //!   populate `FileSettings`.
    //! - Each headline is parsed with `nom` combinators (TODO, priority, title, tags).
    //! - Under a headline, leading planning lines and the property drawer are split off the body.

    use crate::core::*;
    use anyhow::{Context, Result, anyhow};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while1},
        character::complete::{anychar, char, space0, space1},
        combinator::{eof, map, opt, recognize, rest, verify},
        error::VerboseError,
        multi::many1,
        sequence::{delimited, terminated, tuple},
    };
    use std::{fs, path::Path};

    /// Turns document text into a `RawDocument`. Implement this to plug in another tokenizer.
    pub trait RawParser {
        fn parse_str(&self, input: &str) -> Result<RawDocument>;

        fn parse_file(&self, path: &Path) -> Result<RawDocument> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            self.parse_str(&text)
                .with_context(|| format!("parsing {:?}", path))
        }
    }

    /// Default adapter. `todo_keywords` is extended per file by `#+TODO:` style lines.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LineParser {
        pub todo_keywords: Vec<String>,
    }

    impl Default for LineParser {
        fn default() -> Self {
            Self {
                todo_keywords: vec!["TODO".to_string(), "DONE".to_string()],
            }
        }
    }

    impl RawParser for LineParser {
        fn parse_str(&self, input: &str) -> Result<RawDocument> {
            let lines: Vec<&str> = input.lines().collect();
            let first_heading = lines
                .iter()
                .position(|l| is_heading_line(l))
                .unwrap_or(lines.len());

            let mut doc = RawDocument::default();
            let preamble = &lines[..first_heading];
            for line in preamble {
                if let Ok((_, (key, value))) = parse_hash_key_value(line) {
                    doc.settings.push(key, value.trim());
                }
            }
            {
                let root = &mut doc.nodes[NodeId::ROOT.0];
                root.full_lines = preamble.iter().map(|l| l.to_string()).collect();
                root.body_lines = root.full_lines.clone();
            }

            let keywords = self.keywords_for(&doc.settings);

            let mut stack: Vec<NodeId> = vec![NodeId::ROOT];
            let mut idx = first_heading;
            while idx < lines.len() {
                let start = idx;
                idx += 1;
                while idx < lines.len() && !is_heading_line(lines[idx]) {
                    idx += 1;
                }
                let mut node = parse_section(&lines[start..idx], &keywords)
                    .with_context(|| format!("line {}", start + 1))?;

                while let Some(&top) = stack.last() {
                    if top != NodeId::ROOT && doc.node(top).level >= node.level {
                        stack.pop();
                    } else {
                        break;
                    }
                }
                let parent = stack.last().copied().unwrap_or(NodeId::ROOT);
                let id = NodeId(doc.nodes.len());
                node.parent = Some(parent);
                doc.nodes.push(node);
                doc.nodes[parent.0].children.push(id);
                stack.push(id);
            }

            tracing::debug!(
                nodes = doc.nodes.len() - 1,
                settings = doc.settings.values.len(),
                "parsed org document"
            );
            Ok(doc)
        }
    }

    impl LineParser {
        fn keywords_for(&self, settings: &FileSettings) -> Vec<String> {
            let mut keywords = self.todo_keywords.clone();
            for key in ["TODO", "SEQ_TODO", "TYP_TODO"] {
                for value in settings.get(key) {
                    for word in value.split_whitespace().filter(|w| *w != "|") {
                        // `TODO(t)` carries a fast-access key.
                        let word = word.split('(').next().unwrap_or(word);
                        if !word.is_empty() && !keywords.iter().any(|k| k == word) {
                            keywords.push(word.to_string());
                        }
                    }
                }
            }
            keywords
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn to_anyhow(label: &'static str) -> impl Fn(nom::Err<VerboseError<&str>>) -> anyhow::Error {
        move |e| match e {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => {
                let at = ve
                    .errors
                    .first()
                    .map(|(frag, kind)| format!("{:?} ({:?})", frag, kind))
                    .unwrap_or_default();
                anyhow!("parse error in {} at {}", label, at)
            }
            nom::Err::Incomplete(_) => anyhow!("incomplete input while parsing {}", label),
        }
    }

    /* ------------------------------- Utils ------------------------------- */

    pub(crate) fn is_heading_line(s: &str) -> bool {
        // Heading when line starts with one-or-more '*' then at least one space.
        let stars = s.chars().take_while(|c| *c == '*').count();
        stars >= 1 && matches!(s[stars..].chars().next(), Some(' ') | Some('\t'))
    }

    fn is_tag_char(c: char) -> bool {
        // conservative subset for tags; Org is more lenient.
        c.is_alphanumeric() || c == '_' || c == '-' || c == '@' || c == '+' || c == '#' || c == '%'
    }

    fn is_planning_line(s: &str) -> bool {
        let t = s.trim_start();
        t.starts_with("SCHEDULED:") || t.starts_with("DEADLINE:") || t.starts_with("CLOSED:")
    }

    /* ------------------------------ Sections ------------------------------ */

    fn parse_section(lines: &[&str], keywords: &[String]) -> Result<RawNode> {
        let Some((first, body)) = lines.split_first() else {
            return Err(anyhow!("empty section"));
        };
        let (_, headline) = parse_headline(first, keywords).map_err(to_anyhow("headline"))?;
        let (properties, body_lines) = split_body(body);

        Ok(RawNode {
            heading: headline.title.to_string(),
            level: headline.level,
            todo: headline.todo.map(str::to_string),
            priority: headline.priority,
            shallow_tags: headline.tags,
            properties,
            body_lines,
            full_lines: lines.iter().map(|l| l.to_string()).collect(),
            children: vec![],
            parent: None,
            root: false,
        })
    }

    /// Drops leading planning lines and the property drawer that follows them.
    fn split_body(body: &[&str]) -> (IndexMap<String, String>, Vec<String>) {
        let mut i = 0;
        while i < body.len() && is_planning_line(body[i]) {
            i += 1;
        }

        let mut props = IndexMap::new();
        if i < body.len() && body[i].trim() == ":PROPERTIES:" {
            if let Some(end) = body[i + 1..].iter().position(|l| l.trim() == ":END:") {
                for line in &body[i + 1..i + 1 + end] {
                    if let Ok((_, (k, v))) = parse_property_line(line) {
                        props.insert(k.to_string(), v.trim().to_string());
                    }
                }
                i += end + 2;
            }
        }

        let mut rest: Vec<String> = Vec::with_capacity(body.len() - i);
        let mut skipping = true;
        for line in &body[i..] {
            // planning may also follow the drawer
            if skipping && is_planning_line(line) {
                continue;
            }
            skipping = false;
            rest.push(line.to_string());
        }
        (props, rest)
    }

    /* ------------------------------ Headlines ------------------------------ */

    #[derive(Debug)]
    struct Headline<'a> {
        level: usize,
        todo: Option<&'a str>,
        priority: Option<char>,
        title: &'a str,
        tags: Vec<Tag>,
    }

    fn parse_headline<'a>(i: &'a str, keywords: &[String]) -> PResult<'a, Headline<'a>> {
        let (i, stars) = recognize(many1(char('*')))(i)?;
        let level = stars.len();
        let (i, _) = space1(i)?;

        let (i, todo) = opt(terminated(
            verify(
                take_while1(|c: char| c.is_ascii_uppercase() || c == '_' || c == '-'),
                |w: &str| keywords.iter().any(|k| k == w),
            ),
            alt((space1, eof)),
        ))(i)?;

        let (i, priority) = opt(delimited(tag("[#"), anychar, char(']')))(i)?;
        let (i, _) = space0(i)?;

        // input is a single line already; `rest` keeps stray `\r` in the title
        let (i, title_and_tags) = rest(i)?;
        let (title, tags) = split_trailing_tags(title_and_tags);

        Ok((
            i,
            Headline {
                level,
                todo,
                priority,
                title: title.trim(),
                tags,
            },
        ))
    }

    fn split_trailing_tags(title: &str) -> (&str, Vec<Tag>) {
        let trimmed = title.trim_end();
        let (head, trail) = match trimmed.rfind([' ', '\t']) {
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => ("", trimmed),
        };
        if trail.len() > 1 && trail.starts_with(':') && trail.ends_with(':') {
            let parts: Vec<&str> = trail[1..trail.len() - 1].split(':').collect();
            if parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(is_tag_char))
            {
                return (head.trim_end(), parts.into_iter().map(Tag::from).collect());
            }
        }
        (trimmed, vec![])
    }

    /* --------------------------- Settings & drawers --------------------------- */

    fn parse_hash_key_value(i: &str) -> PResult<'_, (&str, &str)> {
        // #+key: value
        map(
            tuple((
                tag("#+"),
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
                tag(":"),
                space0,
                rest,
            )),
            |(_, key, _, _, val)| (key, val),
        )(i)
    }

    fn parse_property_line(i: &str) -> PResult<'_, (&str, &str)> {
        //  :KEY: value
        map(
            tuple((
                space0,
                char(':'),
                take_while1(|c: char| c != ':' && !c.is_whitespace()),
                char(':'),
                space0,
                rest,
            )),
            |(_, _, key, _, _, val)| (key, val),
        )(i)
    }

}

pub mod dates {
    //! Creation-date extraction.
    //!
    //! Strict parsing accepts the bracketed org timestamp shapes `YYYY-MM-DD`,
    //! `YYYY-MM-DD Dow`, `YYYY-MM-DD HH:MM` and `YYYY-MM-DD Dow HH:MM`. The fuzzy
    //! path runs a pluggable `FuzzyDateFinder` over free text, after repairing
    //! three-digit clock times and before discarding implausible years.

    use crate::core::{OrgDate, OrgError};
    use chrono::{NaiveDate, NaiveTime};
    use nom::{
        IResult,
        bytes::complete::{take_while, take_while1},
        character::complete::{char, space0, space1},
        combinator::{eof, map_res, opt, verify},
        error::{VerboseError, VerboseErrorKind},
        sequence::{preceded, tuple},
    };
    use regex::Regex;
    use std::{borrow::Cow, ops::RangeInclusive, sync::OnceLock};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    const WEEKDAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

    fn org_datestr_regex() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"\[\d{4}-\d{2}-\d{2}.*?\]").expect("valid date pattern"))
    }

    fn three_digit_time_regex() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(r"\b(\d{3})(\s*[AaPp]\.?[Mm]\b)").expect("valid time pattern")
        })
    }

    /// First `[YYYY-MM-DD...]` substring of `s`, brackets included.
    pub fn extract_org_datestr(s: &str) -> Option<&str> {
        org_datestr_regex().find(s).map(|m| m.as_str())
    }

    /// Strict org timestamp parsing; anything but the four accepted shapes is
    /// `OrgError::BadDateFormat`.
    pub fn parse_org_date(s: &str) -> Result<OrgDate, OrgError> {
        let inner = s
            .trim()
            .trim_matches(|c: char| c == '[' || c == ']')
            .trim();
        match timestamp_body(inner) {
            Ok((_, date)) => Ok(date),
            Err(_) => Err(OrgError::BadDateFormat(s.trim().to_string())),
        }
    }

    fn timestamp_body(i: &str) -> PResult<'_, OrgDate> {
        let (i, (date, _weekday, time, _, _)) = tuple((
            parse_date,
            opt(preceded(space1, parse_weekday)),
            opt(preceded(space1, parse_time)),
            space0,
            eof,
        ))(i)?;
        let parsed = match time {
            Some(t) => OrgDate::DateTime(date.and_time(t)),
            None => OrgDate::Date(date),
        };
        Ok((i, parsed))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    // The day name is checked for spelling only, never against the date.
    fn parse_weekday(i: &str) -> PResult<'_, &str> {
        verify(take_while1(|c: char| c.is_alphabetic()), |w: &str| {
            WEEKDAYS.iter().any(|d| d.eq_ignore_ascii_case(w))
        })(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (i, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((i, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    /* ------------------------------ Fuzzy dates ------------------------------ */

    /// Finds candidate dates anywhere in free text, in order of appearance.
    pub trait FuzzyDateFinder: Send + Sync {
        fn find_dates(&self, text: &str) -> Vec<OrgDate>;
    }

    /// `851 AM` becomes `0851 AM`; everything else is left alone.
    pub fn repair_time_strings(text: &str) -> Cow<'_, str> {
        three_digit_time_regex().replace_all(text, "0${1}${2}")
    }

    /// Years a clipped heading can plausibly refer to.
    pub fn plausible_years(current_year: i32) -> RangeInclusive<i32> {
        (current_year - 100)..=(current_year + 5)
    }

    /// Best-effort extraction: repair, find, filter by year, then take the first hit.
    pub fn extract_fuzzy(
        finder: &dyn FuzzyDateFinder,
        text: &str,
        current_year: i32,
    ) -> Option<OrgDate> {
        let repaired = repair_time_strings(text);
        let years = plausible_years(current_year);
        let mut candidates: Vec<OrgDate> = finder
            .find_dates(&repaired)
            .into_iter()
            .filter(|d| {
                let keep = years.contains(&d.year());
                if !keep {
                    tracing::debug!(text, candidate = %d, "discarding implausible fuzzy date");
                }
                keep
            })
            .collect();
        candidates.dedup();

        match candidates.as_slice() {
            [] => None,
            [only] => Some(*only),
            [first, ..] => {
                tracing::info!(
                    text,
                    count = candidates.len(),
                    chosen = %first,
                    "several fuzzy dates found, using the first"
                );
                Some(*first)
            }
        }
    }

    #[cfg(feature = "fuzzy")]
    pub use heuristic::HeuristicDateFinder;

    #[cfg(feature = "fuzzy")]
    mod heuristic {
        use super::FuzzyDateFinder;
        use crate::core::OrgDate;
        use chrono::{NaiveDate, NaiveTime};
        use regex::{Captures, Regex};
        use std::sync::OnceLock;

        const MONTHS: &str = "jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?";

        // `0851 AM`, `12:37:24 PM`, `20:55`, `5pm`
        const TIME: &str = r"(?:(?P<hhmm>\d{4})\s*(?P<ap1>[ap]\.?m\b\.?)|(?P<hour>\d{1,2}):(?P<minute>\d{2})(?::(?P<second>\d{2}))?(?:\s*(?P<ap2>[ap]\.?m\b\.?))?|(?P<bare>\d{1,2})\s*(?P<ap3>[ap]\.?m\b\.?))";

        #[derive(Debug, Clone, Copy)]
        enum Shape {
            Iso,
            MonthDayYear,
            DayMonthYear,
            Slashed,
        }

        fn patterns() -> &'static [(Shape, Regex)] {
            static PATTERNS: OnceLock<Vec<(Shape, Regex)>> = OnceLock::new();
            PATTERNS.get_or_init(|| {
                let time = format!(r"(?:(?:,\s*|\s+|T)(?:at\s+)?{TIME})?");
                [
                    (
                        Shape::Iso,
                        format!(r"\b(?P<year>\d{{4}})-(?P<month>\d{{1,2}})-(?P<day>\d{{1,2}}){time}"),
                    ),
                    (
                        Shape::MonthDayYear,
                        format!(
                            r"\b(?P<mon>{MONTHS})\.?\s+(?P<day>\d{{1,2}})(?:st|nd|rd|th)?,?\s+(?P<year>\d{{4}})\b{time}"
                        ),
                    ),
                    (
                        Shape::DayMonthYear,
                        format!(
                            r"\b(?P<day>\d{{1,2}})(?:st|nd|rd|th)?\s+(?P<mon>{MONTHS})\.?,?\s+(?P<year>\d{{4}})\b{time}"
                        ),
                    ),
                    (
                        Shape::Slashed,
                        format!(r"\b(?P<first>\d{{1,2}})/(?P<second_n>\d{{1,2}})/(?P<year>\d{{4}})\b{time}"),
                    ),
                ]
                .into_iter()
                .map(|(shape, src)| {
                    let re = Regex::new(&format!("(?i){src}")).expect("valid fuzzy date pattern");
                    (shape, re)
                })
                .collect()
            })
        }

        /// Regex heuristics for the handful of shapes clipped sources use:
        /// ISO dates, `October 31, 2017`, `31 October 2017` and US `10/31/2017`,
        /// each optionally followed by a clock time.
        #[derive(Debug, Default, Clone, Copy)]
        pub struct HeuristicDateFinder;

        impl FuzzyDateFinder for HeuristicDateFinder {
            fn find_dates(&self, text: &str) -> Vec<OrgDate> {
                let mut found: Vec<(usize, usize, OrgDate)> = Vec::new();
                for (shape, re) in patterns() {
                    for caps in re.captures_iter(text) {
                        let Some(whole) = caps.get(0) else { continue };
                        if let Some(date) = build(*shape, &caps) {
                            found.push((whole.start(), whole.end(), date));
                        }
                    }
                }
                // earliest first, longest match wins an overlap
                found.sort_by_key(|(start, end, _)| (*start, std::cmp::Reverse(*end)));
                let mut out = Vec::new();
                let mut last_end = 0;
                for (start, end, date) in found {
                    if start < last_end {
                        continue;
                    }
                    last_end = end;
                    out.push(date);
                }
                out
            }
        }

        fn num(caps: &Captures<'_>, name: &str) -> Option<u32> {
            caps.name(name).and_then(|m| m.as_str().parse().ok())
        }

        fn month_from_name(name: &str) -> Option<u32> {
            let prefix: String = name.chars().take(3).collect::<String>().to_ascii_lowercase();
            let idx = [
                "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
            ]
            .iter()
            .position(|m| *m == prefix)?;
            Some(idx as u32 + 1)
        }

        fn build(shape: Shape, caps: &Captures<'_>) -> Option<OrgDate> {
            let year: i32 = caps.name("year")?.as_str().parse().ok()?;
            let (month, day) = match shape {
                Shape::Iso => (num(caps, "month")?, num(caps, "day")?),
                Shape::MonthDayYear | Shape::DayMonthYear => {
                    (month_from_name(caps.name("mon")?.as_str())?, num(caps, "day")?)
                }
                Shape::Slashed => {
                    let (a, b) = (num(caps, "first")?, num(caps, "second_n")?);
                    if a > 12 { (b, a) } else { (a, b) }
                }
            };
            let date = NaiveDate::from_ymd_opt(year, month, day)?;
            Some(match time_of(caps) {
                Some(t) => OrgDate::DateTime(date.and_time(t)),
                None => OrgDate::Date(date),
            })
        }

        fn time_of(caps: &Captures<'_>) -> Option<NaiveTime> {
            let meridiem = ["ap1", "ap2", "ap3"]
                .iter()
                .find_map(|g| caps.name(g))
                .map(|m| m.as_str().to_ascii_lowercase().starts_with('p'));

            let (hour, minute, second) = if let Some(hhmm) = num(caps, "hhmm") {
                (hhmm / 100, hhmm % 100, 0)
            } else if let Some(hour) = num(caps, "hour") {
                (hour, num(caps, "minute")?, num(caps, "second").unwrap_or(0))
            } else {
                (num(caps, "bare")?, 0, 0)
            };

            let hour = match meridiem {
                Some(true) if hour < 12 => hour + 12,
                Some(false) if hour == 12 => 0,
                _ => hour,
            };
            NaiveTime::from_hms_opt(hour, minute, second)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDateTime;
        use proptest::prelude::*;

        fn dt(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, s)
                .unwrap()
        }

        #[test]
        fn strict_formats_in_order() {
            assert_eq!(
                parse_org_date("[2018-10-23 Tue 20:55]").unwrap(),
                OrgDate::DateTime(dt(2018, 10, 23, 20, 55, 0))
            );
            assert_eq!(
                parse_org_date("[2018-10-11 20:55]").unwrap(),
                OrgDate::DateTime(dt(2018, 10, 11, 20, 55, 0))
            );
            assert_eq!(
                parse_org_date("[2018-10-23 Tue]").unwrap(),
                OrgDate::Date(NaiveDate::from_ymd_opt(2018, 10, 23).unwrap())
            );
            assert_eq!(
                parse_org_date("2018-10-23").unwrap(),
                OrgDate::Date(NaiveDate::from_ymd_opt(2018, 10, 23).unwrap())
            );
        }

        #[test]
        fn weekday_is_not_checked_against_calendar() {
            // 2010-01-03 was a Sunday
            let d = parse_org_date("[2010-01-03 Fri  ]").unwrap();
            assert_eq!(d.date(), NaiveDate::from_ymd_opt(2010, 1, 3).unwrap());
        }

        #[test]
        fn malformed_strings_are_errors() {
            for bad in [
                "[2018-13-01]",
                "[2018-10-23 Someday]",
                "[2018-10-23 Tuesday 20:55]",
                "[2018-10-23 Tue 20:55 +1w]",
                "[]",
            ] {
                assert!(
                    matches!(parse_org_date(bad), Err(OrgError::BadDateFormat(_))),
                    "{bad} should fail"
                );
            }
        }

        #[test]
        fn extracts_first_bracketed_date() {
            assert_eq!(
                extract_org_datestr("[#A] [2018-10-23 Tue 20:55] also [2019-01-01]"),
                Some("[2018-10-23 Tue 20:55]")
            );
            assert_eq!(extract_org_datestr("no [date] here"), None);
        }

        #[test]
        fn repairs_three_digit_times_only() {
            assert_eq!(repair_time_strings("Clipped at 851 AM"), "Clipped at 0851 AM");
            assert_eq!(repair_time_strings("at 1851 AM"), "at 1851 AM");
            assert_eq!(repair_time_strings("page 851 of 900"), "page 851 of 900");
        }

        #[test]
        fn plausible_year_window() {
            let years = plausible_years(2026);
            assert!(years.contains(&1926));
            assert!(years.contains(&2031));
            assert!(!years.contains(&1925));
            assert!(!years.contains(&2032));
        }

        struct Fixed(Vec<OrgDate>);

        impl FuzzyDateFinder for Fixed {
            fn find_dates(&self, _text: &str) -> Vec<OrgDate> {
                self.0.clone()
            }
        }

        #[test]
        fn fuzzy_filters_years_and_takes_first() {
            let far = OrgDate::Date(NaiveDate::from_ymd_opt(1234, 5, 6).unwrap());
            let a = OrgDate::Date(NaiveDate::from_ymd_opt(2019, 1, 1).unwrap());
            let b = OrgDate::Date(NaiveDate::from_ymd_opt(2019, 2, 1).unwrap());
            assert_eq!(extract_fuzzy(&Fixed(vec![far, a, b]), "x", 2026), Some(a));
            assert_eq!(extract_fuzzy(&Fixed(vec![far]), "x", 2026), None);
            assert_eq!(extract_fuzzy(&Fixed(vec![]), "x", 2026), None);
        }

        #[cfg(feature = "fuzzy")]
        #[test]
        fn heuristic_reads_kindle_clipping() {
            let found = extract_fuzzy(
                &HeuristicDateFinder,
                "TODO from-kindle Added on Tuesday, October 31, 2017 12:37:24 PM",
                2026,
            );
            assert_eq!(found, Some(OrgDate::DateTime(dt(2017, 10, 31, 12, 37, 24))));
        }

        #[cfg(feature = "fuzzy")]
        #[test]
        fn heuristic_uses_repaired_time() {
            let found = extract_fuzzy(&HeuristicDateFinder, "Saved March 3, 2019 851 AM", 2026);
            assert_eq!(found, Some(OrgDate::DateTime(dt(2019, 3, 3, 8, 51, 0))));
        }

        #[cfg(feature = "fuzzy")]
        #[test]
        fn heuristic_shapes() {
            let finder = HeuristicDateFinder;
            assert_eq!(
                finder.find_dates("meet 5 January 2020 then 2020-02-03T10:15"),
                vec![
                    OrgDate::Date(NaiveDate::from_ymd_opt(2020, 1, 5).unwrap()),
                    OrgDate::DateTime(dt(2020, 2, 3, 10, 15, 0)),
                ]
            );
            assert_eq!(
                finder.find_dates("due 10/31/2017 5pm"),
                vec![OrgDate::DateTime(dt(2017, 10, 31, 17, 0, 0))]
            );
            assert!(finder.find_dates("call 555-1234 please").is_empty());
        }

        #[cfg(feature = "fuzzy")]
        #[test]
        fn heuristic_ignores_implausible_ids() {
            assert_eq!(extract_fuzzy(&HeuristicDateFinder, "ticket 9999-12-01", 2026), None);
        }

        proptest! {
            #[test]
            fn strict_round_trip(
                y in 1900i32..2100,
                m in 1u32..=12,
                d in 1u32..=28,
                time in proptest::option::of((0u32..24, 0u32..60)),
                with_weekday in any::<bool>(),
            ) {
                let date = NaiveDate::from_ymd_opt(y, m, d).unwrap();
                let mut text = format!("[{}", date.format("%Y-%m-%d"));
                if with_weekday {
                    text.push_str(&format!(" {}", date.format("%a")));
                }
                if let Some((h, min)) = time {
                    text.push_str(&format!(" {:02}:{:02}", h, min));
                }
                text.push(']');

                let parsed = parse_org_date(&text).unwrap();
                prop_assert_eq!(parsed.date(), date);
                prop_assert_eq!(parsed.time(), time.map(|(h, min)| NaiveTime::from_hms_opt(h, min, 0).unwrap()));
            }

            #[test]
            fn display_parses_back(
                y in 1900i32..2100,
                m in 1u32..=12,
                d in 1u32..=28,
                h in 0u32..24,
                min in 0u32..60,
            ) {
                let value = OrgDate::DateTime(dt(y, m, d, h, min, 0));
                prop_assert_eq!(parse_org_date(&value.to_string()).unwrap(), value);
            }
        }
    }
}

pub mod table {
    use indexmap::IndexMap;
    use regex::Regex;
    use serde::{Deserialize, Serialize};
    use std::sync::OnceLock;

    fn table_row_regex() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"^\s*\|(?P<cells>(?:.+\|)+)\s*$").expect("valid row pattern"))
    }

    /// Cells of a `| a | b |` line, or `None` when the line is not a table row.
    pub fn split_row(line: &str) -> Option<Vec<&str>> {
        let caps = table_row_regex().captures(line)?;
        let cells = caps.name("cells")?.as_str();
        let split: Vec<&str> = if is_separator(line) {
            cells.split(['|', '+']).filter(|c| !c.is_empty()).collect()
        } else {
            // strip the closing pipe so it does not yield an empty trailing cell
            let cells = cells.strip_suffix('|').unwrap_or(cells);
            cells.split('|').collect()
        };
        Some(split)
    }

    /// Org's own rule: a horizontal line starts with `|-`.
    fn is_separator(line: &str) -> bool {
        line.trim_start().starts_with("|-")
    }

    /// A table parsed from a contiguous run of row lines.
    ///
    /// `columns` come from the last row before the first separator. Without a
    /// header, cells are keyed by their zero-based index.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Table {
        columns: Vec<String>,
        rows: Vec<IndexMap<String, String>>,
        /// Source lines, kept so the body can be reproduced exactly.
        raw: Vec<String>,
    }

    impl Table {
        /// Builds a table from lines that all satisfy `split_row`; others are skipped.
        pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Self {
            let mut before_first_sep: Vec<Vec<&str>> = Vec::new();
            let mut after_first_sep: Vec<Vec<&str>> = Vec::new();
            let mut seen_sep = false;
            for line in lines {
                let line = line.as_ref();
                let Some(cells) = split_row(line) else {
                    continue;
                };
                if is_separator(line) {
                    seen_sep = true;
                    continue;
                }
                if seen_sep {
                    after_first_sep.push(cells);
                } else {
                    before_first_sep.push(cells);
                }
            }

            let columns: Vec<String> = if seen_sep {
                before_first_sep
                    .last()
                    .map(|header| header.iter().map(|c| c.trim().to_string()).collect())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            let body = if seen_sep {
                after_first_sep
            } else {
                before_first_sep
            };

            let rows = body
                .into_iter()
                .map(|cells| {
                    cells
                        .into_iter()
                        .enumerate()
                        .map(|(i, val)| {
                            let key = columns.get(i).cloned().unwrap_or_else(|| i.to_string());
                            (key, val.trim().to_string())
                        })
                        .collect()
                })
                .collect();

            Self {
                columns,
                rows,
                raw: lines.iter().map(|l| l.as_ref().to_string()).collect(),
            }
        }

        pub fn columns(&self) -> &[String] {
            &self.columns
        }

        pub fn rows(&self) -> &[IndexMap<String, String>] {
            &self.rows
        }

        pub fn len(&self) -> usize {
            self.rows.len()
        }

        pub fn is_empty(&self) -> bool {
            self.rows.is_empty()
        }

        /// Cell at data row `row` (separators and header excluded) under `column`.
        pub fn get(&self, row: usize, column: &str) -> Option<&str> {
            self.rows.get(row)?.get(column).map(String::as_str)
        }

        pub fn raw(&self) -> &[String] {
            &self.raw
        }
    }

    impl std::ops::Index<usize> for Table {
        type Output = IndexMap<String, String>;

        fn index(&self, row: usize) -> &Self::Output {
            &self.rows[row]
        }
    }

}

pub mod config {
    use crate::dates::FuzzyDateFinder;
    use std::{fmt, sync::Arc};

    /// Document-wide options.
    ///
    /// `date_finder` being `None` means fuzzy extraction is unavailable; asking for
    /// fuzzy dates then yields no date and a one-time warning.
    #[derive(Clone)]
    pub struct OrgOptions {
        /// Fall back to natural-language dates in the heading for `Org::created`.
        pub fuzzy_dates: bool,
        pub date_finder: Option<Arc<dyn FuzzyDateFinder>>,
    }

    impl Default for OrgOptions {
        fn default() -> Self {
            Self {
                fuzzy_dates: false,
                date_finder: Self::default_finder(),
            }
        }
    }

    impl OrgOptions {
        #[cfg(feature = "fuzzy")]
        fn default_finder() -> Option<Arc<dyn FuzzyDateFinder>> {
            Some(Arc::new(crate::dates::HeuristicDateFinder))
        }

        #[cfg(not(feature = "fuzzy"))]
        fn default_finder() -> Option<Arc<dyn FuzzyDateFinder>> {
            None
        }

        pub fn with_fuzzy_dates(mut self, enabled: bool) -> Self {
            self.fuzzy_dates = enabled;
            self
        }

        pub fn with_date_finder(mut self, finder: Arc<dyn FuzzyDateFinder>) -> Self {
            self.date_finder = Some(finder);
            self
        }

        pub fn without_date_finder(mut self) -> Self {
            self.date_finder = None;
            self
        }
    }

    impl fmt::Debug for OrgOptions {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("OrgOptions")
                .field("fuzzy_dates", &self.fuzzy_dates)
                .field("date_finder", &self.date_finder.is_some())
                .finish()
        }
    }
}

pub mod tree {
    //! The org tree: an `OrgDocument` owns the raw arena plus per-node memo
    //! caches, and `Org<'a>` is a cheap borrowed handle onto one node.
    //!
    //! Headings, tags, properties, contents and dates are derived on access.
    //! Headings and contents are memoized in `OnceLock`s, so a document can be
    //! shared across threads for reading.

    use crate::config::OrgOptions;
    use crate::core::*;
    use crate::dates::{self, extract_org_datestr, parse_org_date};
    use crate::parser::{LineParser, RawParser};
    use crate::table::{self, Table};
    use chrono::{Datelike, Local};
    use indexmap::IndexMap;
    use std::{
        collections::BTreeSet,
        fmt,
        ops::Deref,
        path::Path,
        sync::{
            OnceLock,
            atomic::{AtomicBool, Ordering},
        },
    };

    #[derive(Debug)]
    struct Preheading {
        heading: String,
        implicit_created: Option<String>,
    }

    #[derive(Debug)]
    enum Block {
        Text(String),
        Table(Table),
    }

    #[derive(Debug, Default)]
    struct NodeCache {
        preheading: OnceLock<Preheading>,
        contents: OnceLock<Vec<Block>>,
    }

    /// A parsed org document. Read-only after construction.
    #[derive(Debug)]
    pub struct OrgDocument {
        raw: RawDocument,
        options: OrgOptions,
        cache: Vec<NodeCache>,
        fuzzy_warned: AtomicBool,
    }

    impl OrgDocument {
        pub fn from_string(text: &str) -> anyhow::Result<Self> {
            Self::from_string_with(text, OrgOptions::default())
        }

        pub fn from_string_with(text: &str, options: OrgOptions) -> anyhow::Result<Self> {
            let raw = LineParser::default().parse_str(text)?;
            Ok(Self::from_raw(raw, options))
        }

        pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
            Self::from_file_with(path, OrgOptions::default())
        }

        pub fn from_file_with(path: impl AsRef<Path>, options: OrgOptions) -> anyhow::Result<Self> {
            let raw = LineParser::default().parse_file(path.as_ref())?;
            Ok(Self::from_raw(raw, options))
        }

        /// Wraps a tree produced by any `RawParser`.
        pub fn from_raw(raw: RawDocument, options: OrgOptions) -> Self {
            let cache = raw.nodes.iter().map(|_| NodeCache::default()).collect();
            Self {
                raw,
                options,
                cache,
                fuzzy_warned: AtomicBool::new(false),
            }
        }

        pub fn root(&self) -> Org<'_> {
            Org {
                doc: self,
                id: NodeId::ROOT,
                parent: None,
                position: PositionId::root(),
            }
        }

        pub fn raw(&self) -> &RawDocument {
            &self.raw
        }

        pub fn settings(&self) -> &FileSettings {
            &self.raw.settings
        }

        pub fn title(&self) -> Option<&str> {
            self.raw.settings.get("TITLE").first().map(String::as_str)
        }

        pub fn options(&self) -> &OrgOptions {
            &self.options
        }

        /// True once a fuzzy extraction was requested without a date finder.
        pub fn fuzzy_degraded(&self) -> bool {
            self.fuzzy_warned.load(Ordering::Relaxed)
        }

        fn note_fuzzy_unavailable(&self) {
            if !self.fuzzy_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "fuzzy date extraction requested but no date finder is available; \
                     nodes without explicit dates get none"
                );
            }
        }

        /// Replays `position` from the root.
        pub fn resolve(&self, position: &PositionId) -> Result<Selected<'_>, OrgError> {
            let invalid = || OrgError::InvalidPosition(position.clone());
            let mut current = Selected::Node(self.root());
            for step in position.steps() {
                let Selected::Node(node) = current else {
                    return Err(invalid());
                };
                current = match *step {
                    Step::Child(i) => {
                        Selected::Node(node.children().into_iter().nth(i).ok_or_else(invalid)?)
                    }
                    Step::Content(i) => match node.contents().into_iter().nth(i) {
                        Some(Content::Text(text)) => Selected::Text(text),
                        Some(Content::Table(table)) => Selected::Table(table),
                        None => return Err(invalid()),
                    },
                };
            }
            Ok(current)
        }
    }

    /// Borrowed handle onto one node of an `OrgDocument`.
    ///
    /// `parent` is an arena index, never an owning reference.
    #[derive(Clone)]
    pub struct Org<'a> {
        doc: &'a OrgDocument,
        id: NodeId,
        parent: Option<NodeId>,
        position: PositionId,
    }

    impl<'a> Org<'a> {
        fn raw(&self) -> &'a RawNode {
            self.doc.raw.node(self.id)
        }

        fn cache(&self) -> &'a NodeCache {
            &self.doc.cache[self.id.0]
        }

        pub fn document(&self) -> &'a OrgDocument {
            self.doc
        }

        pub fn id(&self) -> NodeId {
            self.id
        }

        pub fn position(&self) -> &PositionId {
            &self.position
        }

        /// # Panics
        /// When the raw tree marks a node as root that has a parent (or the
        /// reverse): the parse adapter broke its contract.
        pub fn is_root(&self) -> bool {
            let root = self.raw().is_root();
            let no_parent = self.parent.is_none();
            assert_eq!(
                root, no_parent,
                "raw tree disagrees with node parentage at {}",
                self.position
            );
            root
        }

        pub fn parent(&self) -> Option<Org<'a>> {
            let parent = self.parent?;
            let mut steps = self.position.steps().to_vec();
            steps.pop();
            Some(Org {
                doc: self.doc,
                id: parent,
                parent: self.doc.raw.node(parent).parent,
                position: PositionId(steps),
            })
        }

        pub fn level(&self) -> usize {
            self.raw().level
        }

        fn preheading(&self) -> &'a Preheading {
            self.cache()
                .preheading
                .get_or_init(|| derive_preheading(self.raw()))
        }

        /// Heading text without any embedded `[YYYY-MM-DD ...]` date.
        pub fn heading(&self) -> &'a str {
            &self.preheading().heading
        }

        /// Heading text as parsed, embedded dates included.
        pub fn raw_heading(&self) -> &'a str {
            &self.raw().heading
        }

        pub fn todo(&self) -> Option<&'a str> {
            self.raw().todo.as_deref()
        }

        pub fn priority(&self) -> Option<char> {
            self.raw().priority
        }

        pub fn file_tags(&self) -> BTreeSet<Tag> {
            self.doc.raw.settings.file_tags().into_iter().collect()
        }

        /// Tags declared on this heading; the root reports the file tags.
        pub fn self_tags(&self) -> BTreeSet<Tag> {
            if self.is_root() {
                self.file_tags()
            } else {
                self.raw().shallow_tags.iter().cloned().collect()
            }
        }

        /// Own tags plus everything inherited from ancestors and the file.
        pub fn tags(&self) -> BTreeSet<Tag> {
            let mut tags = self.file_tags();
            let mut cur = Some(self.id);
            while let Some(id) = cur {
                let node = self.doc.raw.node(id);
                tags.extend(node.shallow_tags.iter().cloned());
                cur = node.parent;
            }
            tags
        }

        pub fn properties(&self) -> &'a IndexMap<String, String> {
            &self.raw().properties
        }

        pub fn property(&self, key: &str) -> Option<&'a str> {
            self.properties().get(key).map(String::as_str)
        }

        /// Creation timestamp: `CREATED` property, then a date embedded in the
        /// heading, then (when enabled) a fuzzy date found in the heading text.
        ///
        /// A present but malformed date is an error naming this node's heading.
        pub fn created(&self) -> Result<Option<OrgDate>, OrgError> {
            self.created_impl().map_err(|e| OrgError::Node {
                heading: self.raw_heading().to_string(),
                source: Box::new(e),
            })
        }

        fn created_impl(&self) -> Result<Option<OrgDate>, OrgError> {
            if let Some(prop) = self.property("CREATED") {
                return parse_org_date(prop).map(Some);
            }
            if let Some(implicit) = &self.preheading().implicit_created {
                return parse_org_date(implicit).map(Some);
            }
            if !self.doc.options.fuzzy_dates {
                return Ok(None);
            }
            match &self.doc.options.date_finder {
                Some(finder) => Ok(dates::extract_fuzzy(
                    finder.as_ref(),
                    self.raw_heading(),
                    Local::now().year(),
                )),
                None => {
                    self.doc.note_fuzzy_unavailable();
                    Ok(None)
                }
            }
        }

        /// The root's body is the whole preamble; other nodes exclude the heading
        /// line, planning and property drawer.
        pub fn body(&self) -> &'a [String] {
            let raw = self.raw();
            if self.is_root() {
                &raw.full_lines
            } else {
                &raw.body_lines
            }
        }

        fn blocks(&self) -> &'a [Block] {
            self.cache()
                .contents
                .get_or_init(|| split_contents(self.body()))
        }

        /// Body as alternating runs of text and tables.
        pub fn contents(&self) -> Vec<Content<'a>> {
            self.blocks()
                .iter()
                .enumerate()
                .map(|(i, block)| {
                    let position = self.position.content(i);
                    match block {
                        Block::Text(text) => Content::Text(TextFragment { text, position }),
                        Block::Table(table) => Content::Table(TableRef { table, position }),
                    }
                })
                .collect()
        }

        /// Contents flattened back to text; tables come from their source lines.
        pub fn content(&self) -> String {
            self.blocks()
                .iter()
                .map(|block| match block {
                    Block::Text(text) => text.clone(),
                    Block::Table(table) => table.raw().join("\n"),
                })
                .collect::<Vec<_>>()
                .join("\n")
        }

        pub fn children(&self) -> Vec<Org<'a>> {
            self.raw()
                .children
                .iter()
                .enumerate()
                .map(|(i, &id)| Org {
                    doc: self.doc,
                    id,
                    parent: Some(self.id),
                    position: self.position.child(i),
                })
                .collect()
        }

        /// Source lines joined with newlines. With `heading` this is the node's
        /// full source; without it, the body with planning and the property
        /// drawer removed. `recursive` appends every descendant in full.
        ///
        /// # Panics
        /// If `heading` is requested for the root, which has no heading line.
        pub fn get_raw(&self, heading: bool, recursive: bool) -> String {
            assert!(
                !(heading && self.is_root()),
                "the document root has no heading line"
            );
            let mut lines = Vec::new();
            self.collect_raw(heading, recursive, &mut lines);
            lines.join("\n")
        }

        fn collect_raw(&self, heading: bool, recursive: bool, out: &mut Vec<&'a str>) {
            let raw = self.raw();
            let own: &[String] = if heading || raw.is_root() {
                &raw.full_lines
            } else {
                &raw.body_lines
            };
            out.extend(own.iter().map(String::as_str));
            if recursive {
                for child in self.children() {
                    child.collect_raw(true, true, out);
                }
            }
        }

        /// Preorder walk of this node and its descendants, never yielding the
        /// root. `None` means unbounded depth.
        pub fn iterate(&self, depth: Option<usize>) -> Vec<Org<'a>> {
            let mut out = Vec::new();
            self.walk(depth, &mut out);
            out
        }

        fn walk(&self, depth: Option<usize>, out: &mut Vec<Org<'a>>) {
            if !self.is_root() {
                out.push(self.clone());
            }
            if depth == Some(0) {
                return;
            }
            for child in self.children() {
                child.walk(depth.map(|d| d - 1), out);
            }
        }
    }

    impl PartialEq for Org<'_> {
        fn eq(&self, other: &Self) -> bool {
            std::ptr::eq(self.doc, other.doc) && self.id == other.id && self.position == other.position
        }
    }

    impl Eq for Org<'_> {}

    impl fmt::Debug for Org<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Org{{{}}}", self.heading())
        }
    }

    fn derive_preheading(raw: &RawNode) -> Preheading {
        if raw.is_root() {
            return Preheading {
                heading: String::new(),
                implicit_created: None,
            };
        }
        let datestr = extract_org_datestr(&raw.heading);
        let heading = match datestr {
            Some(ds) => raw.heading.replace(ds, ""),
            None => raw.heading.clone(),
        };
        Preheading {
            heading: heading.trim().to_string(),
            implicit_created: datestr.map(str::to_string),
        }
    }

    fn split_contents(lines: &[String]) -> Vec<Block> {
        let is_row = |l: &String| table::split_row(l).is_some();
        lines
            .chunk_by(|a, b| is_row(a) == is_row(b))
            .map(|run| {
                if is_row(&run[0]) {
                    Block::Table(Table::from_lines(run))
                } else {
                    Block::Text(run.join("\n"))
                }
            })
            .collect()
    }

    /* ------------------------------ Content ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TextFragment<'a> {
        pub text: &'a str,
        pub position: PositionId,
    }

    /// A table borrowed from its owning node, tagged with its position.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TableRef<'a> {
        table: &'a Table,
        position: PositionId,
    }

    impl<'a> TableRef<'a> {
        pub fn table(&self) -> &'a Table {
            self.table
        }

        pub fn position(&self) -> &PositionId {
            &self.position
        }
    }

    impl Deref for TableRef<'_> {
        type Target = Table;

        fn deref(&self) -> &Table {
            self.table
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Content<'a> {
        Text(TextFragment<'a>),
        Table(TableRef<'a>),
    }

    impl<'a> Content<'a> {
        pub fn position(&self) -> &PositionId {
            match self {
                Content::Text(t) => &t.position,
                Content::Table(t) => &t.position,
            }
        }

        pub fn as_text(&self) -> Option<&'a str> {
            match self {
                Content::Text(t) => Some(t.text),
                Content::Table(_) => None,
            }
        }

        pub fn as_table(&self) -> Option<&TableRef<'a>> {
            match self {
                Content::Table(t) => Some(t),
                Content::Text(_) => None,
            }
        }
    }

    /// What a PositionId resolves to.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Selected<'a> {
        Node(Org<'a>),
        Table(TableRef<'a>),
        Text(TextFragment<'a>),
    }

    impl<'a> Selected<'a> {
        pub fn position(&self) -> &PositionId {
            match self {
                Selected::Node(n) => n.position(),
                Selected::Table(t) => t.position(),
                Selected::Text(t) => &t.position,
            }
        }

        pub fn kind(&self) -> &'static str {
            match self {
                Selected::Node(_) => "org",
                Selected::Table(_) => "table",
                Selected::Text(_) => "text",
            }
        }

        pub fn into_node(self) -> Option<Org<'a>> {
            match self {
                Selected::Node(n) => Some(n),
                _ => None,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;
        use std::sync::Arc;

        const DATES: &str = "
* Hello
** something
 :PROPERTIES:
 :CREATED: [2018-10-23 Tue 20:55]
 :END:

* etc
* [2018-10-11 20:55] note-with-implicit-date
  sup
** [#A] [2018-10-23 Tue 20:55] also-priority

* [2010-01-03 Fri  ] messed-up

* DONE TODO from-kindle Added on Tuesday, October 31, 2017 12:37:24 PM
    this is from kindle...
    TODO ugh, the date probably gets eaten by org parser...

    ";

        fn find<'a>(doc: &'a OrgDocument, heading: &str) -> Org<'a> {
            let found: Vec<_> = doc
                .root()
                .iterate(None)
                .into_iter()
                .filter(|n| n.heading() == heading)
                .collect();
            assert_eq!(found.len(), 1, "expected one node headed {heading:?}");
            found.into_iter().next().unwrap()
        }

        fn find_part<'a>(doc: &'a OrgDocument, part: &str) -> Org<'a> {
            let found: Vec<_> = doc
                .root()
                .iterate(None)
                .into_iter()
                .filter(|n| n.heading().contains(part))
                .collect();
            assert_eq!(found.len(), 1);
            found.into_iter().next().unwrap()
        }

        fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> chrono::NaiveDateTime {
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(hh, mm, ss)
                .unwrap()
        }

        #[test]
        fn created_from_property_heading_or_nothing() {
            let doc = OrgDocument::from_string(DATES).unwrap();

            let something = find(&doc, "something");
            assert!(something.created().unwrap().unwrap() == at(2018, 10, 23, 20, 55, 0));

            assert_eq!(find(&doc, "etc").created().unwrap(), None);

            let implicit = find(&doc, "note-with-implicit-date");
            assert!(implicit.created().unwrap().unwrap() == at(2018, 10, 11, 20, 55, 0));

            let prio = find(&doc, "also-priority");
            assert_eq!(prio.priority(), Some('A'));
            assert!(prio.created().unwrap().unwrap() == at(2018, 10, 23, 20, 55, 0));

            assert!(find(&doc, "messed-up").created().unwrap().is_some());

            let kindle = find_part(&doc, "from-kindle");
            assert_eq!(kindle.todo(), Some("DONE"));
            assert_eq!(kindle.created().unwrap(), None);
        }

        #[test]
        fn created_property_wins_over_heading_date() {
            let doc = OrgDocument::from_string(
                "* [2018-10-11 20:55] both\n:PROPERTIES:\n:CREATED: [2018-10-23 Tue 20:55]\n:END:\n",
            )
            .unwrap();
            let node = find(&doc, "both");
            assert!(node.created().unwrap().unwrap() == at(2018, 10, 23, 20, 55, 0));
        }

        #[test]
        fn malformed_heading_date_names_the_heading() {
            let doc = OrgDocument::from_string("* [2018-10-23 Someday] x\n").unwrap();
            let node = find(&doc, "x");
            let err = node.created().unwrap_err();
            assert_eq!(err.to_string(), "processing '[2018-10-23 Someday] x' failed");
            match err {
                OrgError::Node { heading, source } => {
                    assert_eq!(heading, "[2018-10-23 Someday] x");
                    assert!(matches!(*source, OrgError::BadDateFormat(_)));
                }
                other => panic!("unexpected error {other:?}"),
            }
        }

        #[cfg(feature = "fuzzy")]
        #[test]
        fn fuzzy_dates_read_kindle_headings() {
            let options = OrgOptions::default().with_fuzzy_dates(true);
            let doc = OrgDocument::from_string_with(DATES, options).unwrap();
            let kindle = find_part(&doc, "from-kindle");
            assert!(kindle.created().unwrap().unwrap() == at(2017, 10, 31, 12, 37, 24));
            // explicit dates still win
            let implicit = find(&doc, "note-with-implicit-date");
            assert!(implicit.created().unwrap().unwrap() == at(2018, 10, 11, 20, 55, 0));
            assert!(!doc.fuzzy_degraded());
        }

        struct Fixed(OrgDate);

        impl crate::dates::FuzzyDateFinder for Fixed {
            fn find_dates(&self, _text: &str) -> Vec<OrgDate> {
                vec![self.0]
            }
        }

        #[test]
        fn custom_finder_is_used_for_fuzzy_dates() {
            let when = OrgDate::DateTime(at(2020, 5, 1, 9, 0, 0));
            let options = OrgOptions::default()
                .with_fuzzy_dates(true)
                .with_date_finder(Arc::new(Fixed(when)));
            let doc = OrgDocument::from_string_with("* anything at all", options).unwrap();
            let node = find(&doc, "anything at all");
            assert_eq!(node.created().unwrap(), Some(when));
        }

        #[test]
        fn missing_finder_degrades_to_no_date() {
            let options = OrgOptions::default()
                .with_fuzzy_dates(true)
                .without_date_finder();
            let doc = OrgDocument::from_string_with(DATES, options).unwrap();
            assert!(!doc.fuzzy_degraded());
            let kindle = find_part(&doc, "from-kindle");
            assert_eq!(kindle.created().unwrap(), None);
            assert_eq!(kindle.created().unwrap(), None);
            assert!(doc.fuzzy_degraded());
        }

        #[test]
        fn malformed_created_names_the_heading() {
            let doc = OrgDocument::from_string(
                "* broken one\n:PROPERTIES:\n:CREATED: sometime soon\n:END:\n",
            )
            .unwrap();
            let err = find(&doc, "broken one").created().unwrap_err();
            assert_eq!(err.to_string(), "processing 'broken one' failed");
            match err {
                OrgError::Node { source, .. } => {
                    assert!(matches!(*source, OrgError::BadDateFormat(_)))
                }
                other => panic!("unexpected error {other:?}"),
            }
        }

        const TAGGED: &str = "#+FILETAGS: :xxxx:
* top :a:
** mid :b:c:
*** leaf :d:
* other
";

        #[test]
        fn tags_accumulate_down_the_tree() {
            let doc = OrgDocument::from_string(TAGGED).unwrap();
            let root = doc.root();
            let leaf = find(&doc, "leaf");

            let names = |set: BTreeSet<Tag>| set.into_iter().map(|t| t.0).collect::<Vec<_>>();
            assert_eq!(names(leaf.self_tags()), vec!["d"]);
            assert_eq!(names(leaf.tags()), vec!["a", "b", "c", "d", "xxxx"]);
            assert_eq!(names(find(&doc, "other").tags()), vec!["xxxx"]);

            assert_eq!(root.tags(), root.self_tags());
            assert_eq!(root.tags(), root.file_tags());

            for node in root.iterate(None) {
                assert!(node.tags().is_superset(&node.self_tags()));
                assert!(node.tags().is_superset(&node.file_tags()));
            }
        }

        #[test]
        fn kindle_style_tags_are_inherited() {
            let doc = OrgDocument::from_string(
                "* Kindle highlights :kindle:\n** Some Book :book:\n*** highlight one\n",
            )
            .unwrap();
            let hl = find(&doc, "highlight one");
            assert!(hl.tags().contains("kindle"));
            assert!(hl.tags().contains("book"));
            assert!(hl.self_tags().is_empty());
        }

        #[test]
        fn contents_split_text_and_tables() {
            let doc = OrgDocument::from_string(
                "* data\nsome notes\n| a | b |\n|---+---|\n| 1 | 2 |\ntrailing\n  more\n",
            )
            .unwrap();
            let node = find(&doc, "data");
            let contents = node.contents();
            assert_eq!(contents.len(), 3);
            assert_eq!(contents[0].as_text(), Some("some notes"));
            let table = contents[1].as_table().unwrap();
            assert_eq!(table.columns(), &["a", "b"]);
            assert_eq!(table.get(0, "b"), Some("2"));
            assert_eq!(contents[2].as_text(), Some("trailing\n  more"));
            assert_eq!(contents[1].position().to_string(), "/child[0]/content[1]");
        }

        #[test]
        fn content_is_lossless_for_every_node() {
            let doc = OrgDocument::from_string(
                "preamble\n| x |\n* first\n\n| k | v |\n|---|\n| 1 | 2 |\n\ntext\n** second\n* third\n",
            )
            .unwrap();
            let root = doc.root();
            assert_eq!(root.content(), root.body().join("\n"));
            for node in root.iterate(None) {
                assert_eq!(node.content(), node.body().join("\n"), "{node:?}");
            }
        }

        const NESTED: &str = "* a\nbody of a\n** b\nbody of b\n* c";

        #[test]
        fn get_raw_reproduces_source() {
            let doc = OrgDocument::from_string(NESTED).unwrap();
            let root = doc.root();
            assert_eq!(root.get_raw(false, true), NESTED);
            let a = find(&doc, "a");
            assert_eq!(a.get_raw(true, false), "* a\nbody of a");
            assert_eq!(a.get_raw(false, false), "body of a");
            assert_eq!(a.get_raw(false, true), "body of a\n** b\nbody of b");
        }

        #[test]
        fn get_raw_without_heading_drops_drawer() {
            let doc = OrgDocument::from_string("* a\n:PROPERTIES:\n:ID: x\n:END:\nbody\n** b").unwrap();
            let a = find(&doc, "a");
            assert_eq!(a.get_raw(false, false), "body");
            assert_eq!(a.get_raw(false, false), a.body().join("\n"));
            assert_eq!(a.get_raw(false, true), "body\n** b");
            assert_eq!(a.get_raw(true, false), "* a\n:PROPERTIES:\n:ID: x\n:END:\nbody");
        }

        #[test]
        #[should_panic]
        fn root_has_no_heading_line() {
            let doc = OrgDocument::from_string(NESTED).unwrap();
            doc.root().get_raw(true, false);
        }

        #[test]
        fn iterate_is_preorder_and_depth_bounded() {
            let doc = OrgDocument::from_string(NESTED).unwrap();
            let root = doc.root();
            let headings = |nodes: Vec<Org<'_>>| {
                nodes.iter().map(|n| n.heading().to_string()).collect::<Vec<_>>()
            };
            assert_eq!(headings(root.iterate(None)), vec!["a", "b", "c"]);
            assert_eq!(headings(root.iterate(Some(1))), vec!["a", "c"]);
            assert!(root.iterate(Some(0)).is_empty());
            let a = find(&doc, "a");
            assert_eq!(headings(a.iterate(Some(0))), vec!["a"]);
        }

        #[test]
        fn parent_and_root_agree() {
            let doc = OrgDocument::from_string(NESTED).unwrap();
            let root = doc.root();
            assert!(root.is_root());
            assert!(root.parent().is_none());
            let b = find(&doc, "b");
            assert!(!b.is_root());
            let a = b.parent().unwrap();
            assert_eq!(a, find(&doc, "a"));
            assert_eq!(a.parent().unwrap(), root);
            assert_eq!(format!("{b:?}"), "Org{b}");
        }

        #[test]
        fn positions_resolve_back_to_the_same_thing() {
            let doc = OrgDocument::from_string("* a\n| t |\n** b\ntext\n").unwrap();
            let root = doc.root();
            for node in root.iterate(None) {
                let resolved = doc.resolve(node.position()).unwrap();
                assert_eq!(resolved, Selected::Node(node.clone()));
                for content in node.contents() {
                    let again = doc.resolve(content.position()).unwrap();
                    assert_eq!(again.position(), content.position());
                }
            }
            let table = doc.resolve(&PositionId::root().child(0).content(0)).unwrap();
            assert_eq!(table.kind(), "table");
            assert!(doc.resolve(&PositionId::root().child(3)).is_err());
            assert!(
                doc.resolve(&PositionId::root().child(0).content(0).child(0))
                    .is_err()
            );
        }

        #[test]
        fn document_metadata() {
            let doc = OrgDocument::from_string("#+TITLE: Notes\n* a\n").unwrap();
            assert_eq!(doc.title(), Some("Notes"));
            assert_eq!(doc.root().heading(), "");
            assert_eq!(doc.root().level(), 0);
        }

        #[test]
        fn documents_are_shareable() {
            fn check<T: Send + Sync>() {}
            check::<OrgDocument>();
        }

        fn tag_suffix(tags: &[String]) -> String {
            if tags.is_empty() {
                String::new()
            } else {
                format!(" :{}:", tags.join(":"))
            }
        }

        proptest::proptest! {
            #[test]
            fn headings_and_tags_survive_parsing(
                title in "[a-z][a-z ]{0,20}[a-z]",
                parent_tags in proptest::collection::vec("[a-z]{1,6}", 0..3),
                own_tags in proptest::collection::vec("[a-z]{1,6}", 0..3),
            ) {
                let text = format!(
                    "* parent{}\n** {title}{}\n",
                    tag_suffix(&parent_tags),
                    tag_suffix(&own_tags)
                );
                let doc = OrgDocument::from_string(&text).unwrap();
                let child = doc.root().children()[0].children()[0].clone();
                proptest::prop_assert_eq!(child.heading(), title.as_str());

                let as_set = |tags: BTreeSet<Tag>| tags.into_iter().map(|t| t.0).collect::<BTreeSet<_>>();
                let own: BTreeSet<String> = own_tags.iter().cloned().collect();
                let all: BTreeSet<String> = own.iter().cloned().chain(parent_tags.iter().cloned()).collect();
                proptest::prop_assert_eq!(as_set(child.self_tags()), own);
                proptest::prop_assert_eq!(as_set(child.tags()), all);
            }
        }
    }
}

pub mod xpath {
    //! Generic labeled tree plus an XPath 1.0 subset evaluated over it.
    //!
    //! Supported: absolute and relative paths, `//`, `.` and `..`, `@attr`,
    //! the child/descendant/ancestor/sibling/self/parent axes, `*`, `text()`
    //! and `node()` tests, positional and boolean predicates, `or`, `and`,
    //! `=`, `!=`, `|` and the common string functions.
    //!
    //! An element's own `text` plays the role of its text node child.

    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while},
        character::complete::{char, digit0, digit1, multispace0, satisfy},
        combinator::{all_consuming, map, map_res, not, opt, recognize, value, verify},
        error::VerboseError,
        multi::{many0, separated_list0},
        sequence::{delimited, pair, preceded, terminated, tuple},
    };
    use std::{fmt, str::FromStr};

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Element {
        pub name: String,
        pub attributes: IndexMap<String, String>,
        pub text: Option<String>,
        pub children: Vec<Element>,
    }

    impl Element {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                ..Self::default()
            }
        }

        pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.attributes.insert(key.into(), value.into());
            self
        }

        pub fn with_text(mut self, text: impl Into<String>) -> Self {
            self.text = Some(text.into());
            self
        }

        pub fn with_child(mut self, child: Element) -> Self {
            self.children.push(child);
            self
        }

        pub fn push(&mut self, child: Element) {
            self.children.push(child);
        }

        pub fn attribute(&self, key: &str) -> Option<&str> {
            self.attributes.get(key).map(String::as_str)
        }

        /// Own text followed by every descendant's, in document order.
        pub fn string_value(&self) -> String {
            let mut out = String::new();
            self.collect_text(&mut out);
            out
        }

        fn collect_text(&self, out: &mut String) {
            if let Some(t) = &self.text {
                out.push_str(t);
            }
            for c in &self.children {
                c.collect_text(out);
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum XPathError {
        #[error("cannot parse query {query:?}: {message}")]
        Parse { query: String, message: String },
        #[error("query type error: {0}")]
        Type(String),
    }

    type Result<T> = std::result::Result<T, XPathError>;

    /* -------------------------------- AST -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Axis {
        Child,
        Descendant,
        DescendantOrSelf,
        SelfNode,
        Parent,
        Ancestor,
        AncestorOrSelf,
        FollowingSibling,
        PrecedingSibling,
        Attribute,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum NodeTest {
        Name(String),
        Any,
        Node,
        Text,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct StepExpr {
        axis: Axis,
        test: NodeTest,
        predicates: Vec<Expr>,
    }

    impl StepExpr {
        fn plain(axis: Axis, test: NodeTest) -> Self {
            Self {
                axis,
                test,
                predicates: vec![],
            }
        }

        fn descendant_or_self() -> Self {
            Self::plain(Axis::DescendantOrSelf, NodeTest::Node)
        }

        fn yields_strings(&self) -> bool {
            self.axis == Axis::Attribute || self.test == NodeTest::Text
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct LocationPath {
        absolute: bool,
        steps: Vec<StepExpr>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum CmpOp {
        Eq,
        Ne,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Expr {
        Or(Box<Expr>, Box<Expr>),
        And(Box<Expr>, Box<Expr>),
        Compare(CmpOp, Box<Expr>, Box<Expr>),
        Union(Box<Expr>, Box<Expr>),
        Literal(String),
        Number(f64),
        Call(String, Vec<Expr>),
        Path(LocationPath),
    }

    /* ------------------------------- Parser ------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
    where
        F: FnMut(&'a str) -> PResult<'a, O>,
    {
        delimited(multispace0, inner, multispace0)
    }

    fn is_name_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_' || c == '-'
    }

    fn name(i: &str) -> PResult<'_, &str> {
        recognize(pair(
            satisfy(|c| c.is_alphabetic() || c == '_'),
            take_while(is_name_char),
        ))(i)
    }

    fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
        terminated(tag(word), not(satisfy(is_name_char)))
    }

    fn literal(i: &str) -> PResult<'_, String> {
        map(
            alt((
                delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
                delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
            )),
            str::to_string,
        )(i)
    }

    fn number(i: &str) -> PResult<'_, f64> {
        map_res(
            alt((
                recognize(pair(digit1, opt(pair(char('.'), digit0)))),
                recognize(pair(char('.'), digit1)),
            )),
            str::parse::<f64>,
        )(i)
    }

    fn expr(i: &str) -> PResult<'_, Expr> {
        let (i, first) = and_expr(i)?;
        let (i, rest) = many0(preceded(ws(keyword("or")), and_expr))(i)?;
        let folded = rest
            .into_iter()
            .fold(first, |l, r| Expr::Or(Box::new(l), Box::new(r)));
        Ok((i, folded))
    }

    fn and_expr(i: &str) -> PResult<'_, Expr> {
        let (i, first) = eq_expr(i)?;
        let (i, rest) = many0(preceded(ws(keyword("and")), eq_expr))(i)?;
        let folded = rest
            .into_iter()
            .fold(first, |l, r| Expr::And(Box::new(l), Box::new(r)));
        Ok((i, folded))
    }

    fn eq_expr(i: &str) -> PResult<'_, Expr> {
        let (i, first) = union_expr(i)?;
        let op = alt((value(CmpOp::Ne, tag("!=")), value(CmpOp::Eq, char('='))));
        let (i, rest) = many0(pair(ws(op), union_expr))(i)?;
        let folded = rest
            .into_iter()
            .fold(first, |l, (op, r)| Expr::Compare(op, Box::new(l), Box::new(r)));
        Ok((i, folded))
    }

    fn union_expr(i: &str) -> PResult<'_, Expr> {
        let (i, first) = primary(i)?;
        let (i, rest) = many0(preceded(ws(char('|')), primary))(i)?;
        let folded = rest
            .into_iter()
            .fold(first, |l, r| Expr::Union(Box::new(l), Box::new(r)));
        Ok((i, folded))
    }

    fn primary(i: &str) -> PResult<'_, Expr> {
        preceded(
            multispace0,
            alt((
                map(literal, Expr::Literal),
                map(number, Expr::Number),
                delimited(
                    terminated(char('('), multispace0),
                    expr,
                    preceded(multispace0, char(')')),
                ),
                function_call,
                map(location_path, Expr::Path),
            )),
        )(i)
    }

    fn function_call(i: &str) -> PResult<'_, Expr> {
        // `text()` and `node()` are node tests, not functions
        let (i, fname) = verify(name, |n: &str| !matches!(n, "text" | "node"))(i)?;
        let (i, _) = preceded(multispace0, char('('))(i)?;
        let (i, args) = separated_list0(ws(char(',')), expr)(i)?;
        let (i, _) = preceded(multispace0, char(')'))(i)?;
        Ok((i, Expr::Call(fname.to_string(), args)))
    }

    fn location_path(i: &str) -> PResult<'_, LocationPath> {
        alt((
            map(preceded(tag("//"), relative_path), |mut steps| {
                steps.insert(0, StepExpr::descendant_or_self());
                LocationPath {
                    absolute: true,
                    steps,
                }
            }),
            map(preceded(char('/'), opt(relative_path)), |steps| LocationPath {
                absolute: true,
                steps: steps.unwrap_or_default(),
            }),
            map(relative_path, |steps| LocationPath {
                absolute: false,
                steps,
            }),
        ))(i)
    }

    fn relative_path(i: &str) -> PResult<'_, Vec<StepExpr>> {
        let (i, first) = step(i)?;
        let (i, rest) = many0(pair(ws(alt((tag("//"), tag("/")))), step))(i)?;
        let mut steps = vec![first];
        for (sep, s) in rest {
            if sep == "//" {
                steps.push(StepExpr::descendant_or_self());
            }
            steps.push(s);
        }
        Ok((i, steps))
    }

    fn step(i: &str) -> PResult<'_, StepExpr> {
        alt((
            value(StepExpr::plain(Axis::Parent, NodeTest::Node), tag("..")),
            value(StepExpr::plain(Axis::SelfNode, NodeTest::Node), char('.')),
            full_step,
        ))(i)
    }

    fn full_step(i: &str) -> PResult<'_, StepExpr> {
        let (i, axis) = opt(alt((
            value(Axis::Attribute, char('@')),
            terminated(axis_name, tag("::")),
        )))(i)?;
        let (i, test) = node_test(i)?;
        let (i, predicates) = many0(preceded(
            multispace0,
            delimited(char('['), expr, preceded(multispace0, char(']'))),
        ))(i)?;
        Ok((
            i,
            StepExpr {
                axis: axis.unwrap_or(Axis::Child),
                test,
                predicates,
            },
        ))
    }

    fn axis_name(i: &str) -> PResult<'_, Axis> {
        alt((
            value(Axis::AncestorOrSelf, tag("ancestor-or-self")),
            value(Axis::Ancestor, tag("ancestor")),
            value(Axis::DescendantOrSelf, tag("descendant-or-self")),
            value(Axis::Descendant, tag("descendant")),
            value(Axis::FollowingSibling, tag("following-sibling")),
            value(Axis::PrecedingSibling, tag("preceding-sibling")),
            value(Axis::Parent, tag("parent")),
            value(Axis::SelfNode, tag("self")),
            value(Axis::Child, tag("child")),
            value(Axis::Attribute, tag("attribute")),
        ))(i)
    }

    fn empty_parens(i: &str) -> PResult<'_, ()> {
        value((), tuple((multispace0, char('('), multispace0, char(')'))))(i)
    }

    fn node_test(i: &str) -> PResult<'_, NodeTest> {
        alt((
            value(NodeTest::Any, char('*')),
            value(NodeTest::Text, pair(tag("text"), empty_parens)),
            value(NodeTest::Node, pair(tag("node"), empty_parens)),
            map(name, |n| NodeTest::Name(n.to_string())),
        ))(i)
    }

    /* ------------------------------ Evaluation ------------------------------ */

    #[derive(Debug, Clone)]
    enum Value {
        Nodes(Vec<usize>),
        /// Attribute values or text pieces selected by a final `@x` / `text()` step.
        Strings(Vec<String>),
        Str(String),
        Num(f64),
        Bool(bool),
    }

    impl Value {
        fn kind(&self) -> &'static str {
            match self {
                Value::Nodes(_) => "node-set",
                Value::Strings(_) => "string-set",
                Value::Str(_) => "string",
                Value::Num(_) => "number",
                Value::Bool(_) => "boolean",
            }
        }
    }

    #[derive(Debug, Clone, Copy)]
    struct Ctx {
        node: usize,
        position: usize,
        size: usize,
    }

    struct Slot<'e> {
        element: Option<&'e Element>,
        parent: Option<usize>,
        children: Vec<usize>,
        /// One past the last descendant, in preorder.
        end: usize,
    }

    /// Preorder flattening of an element tree; slot 0 is the document node
    /// whose only child is the root element.
    struct Flat<'e> {
        slots: Vec<Slot<'e>>,
    }

    impl<'e> Flat<'e> {
        fn new(root: &'e Element) -> Self {
            let mut flat = Flat {
                slots: vec![Slot {
                    element: None,
                    parent: None,
                    children: vec![],
                    end: 0,
                }],
            };
            let id = flat.add(root, 0);
            flat.slots[0].children.push(id);
            flat.slots[0].end = flat.slots.len();
            flat
        }

        fn add(&mut self, element: &'e Element, parent: usize) -> usize {
            let id = self.slots.len();
            self.slots.push(Slot {
                element: Some(element),
                parent: Some(parent),
                children: vec![],
                end: 0,
            });
            for child in &element.children {
                let cid = self.add(child, id);
                self.slots[id].children.push(cid);
            }
            self.slots[id].end = self.slots.len();
            id
        }

        fn string_value(&self, n: usize) -> String {
            match self.slots[n].element {
                Some(e) => e.string_value(),
                None => self.slots[n]
                    .children
                    .iter()
                    .map(|&c| self.string_value(c))
                    .collect(),
            }
        }

        fn axis(&self, n: usize, axis: Axis) -> Vec<usize> {
            let slot = &self.slots[n];
            match axis {
                Axis::Child => slot.children.clone(),
                Axis::Descendant => (n + 1..slot.end).collect(),
                Axis::DescendantOrSelf => (n..slot.end).collect(),
                Axis::SelfNode => vec![n],
                Axis::Parent => slot.parent.into_iter().collect(),
                Axis::Ancestor | Axis::AncestorOrSelf => {
                    let mut out = Vec::new();
                    if axis == Axis::AncestorOrSelf {
                        out.push(n);
                    }
                    let mut cur = slot.parent;
                    while let Some(p) = cur {
                        out.push(p);
                        cur = self.slots[p].parent;
                    }
                    out
                }
                Axis::FollowingSibling | Axis::PrecedingSibling => {
                    let Some(p) = slot.parent else {
                        return vec![];
                    };
                    let siblings = &self.slots[p].children;
                    let at = siblings.iter().position(|&s| s == n).unwrap_or(0);
                    if axis == Axis::FollowingSibling {
                        siblings[at + 1..].to_vec()
                    } else {
                        siblings[..at].iter().rev().copied().collect()
                    }
                }
                // attribute steps never reach node selection
                Axis::Attribute => vec![],
            }
        }

        fn matches(&self, n: usize, test: &NodeTest) -> bool {
            match (test, self.slots[n].element) {
                (NodeTest::Node, _) => true,
                (NodeTest::Any, e) => e.is_some(),
                (NodeTest::Name(name), Some(e)) => e.name == *name,
                _ => false,
            }
        }

        fn strings_for(&self, n: usize, step: &StepExpr) -> Vec<String> {
            let Some(e) = self.slots[n].element else {
                return vec![];
            };
            if step.axis == Axis::Attribute {
                match &step.test {
                    NodeTest::Name(name) => e.attributes.get(name).cloned().into_iter().collect(),
                    NodeTest::Any | NodeTest::Node => e.attributes.values().cloned().collect(),
                    NodeTest::Text => vec![],
                }
            } else {
                e.text.clone().into_iter().collect()
            }
        }

        fn eval(&self, expr: &Expr, ctx: Ctx) -> Result<Value> {
            match expr {
                Expr::Literal(s) => Ok(Value::Str(s.clone())),
                Expr::Number(n) => Ok(Value::Num(*n)),
                Expr::Or(l, r) => {
                    let l = self.eval(l, ctx)?;
                    if self.truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    let r = self.eval(r, ctx)?;
                    Ok(Value::Bool(self.truthy(&r)))
                }
                Expr::And(l, r) => {
                    let l = self.eval(l, ctx)?;
                    if !self.truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    let r = self.eval(r, ctx)?;
                    Ok(Value::Bool(self.truthy(&r)))
                }
                Expr::Compare(op, l, r) => {
                    let l = self.eval(l, ctx)?;
                    let r = self.eval(r, ctx)?;
                    Ok(Value::Bool(self.compare(*op, &l, &r)))
                }
                Expr::Union(l, r) => match (self.eval(l, ctx)?, self.eval(r, ctx)?) {
                    (Value::Nodes(mut a), Value::Nodes(b)) => {
                        a.extend(b);
                        a.sort_unstable();
                        a.dedup();
                        Ok(Value::Nodes(a))
                    }
                    (a, b) => Err(XPathError::Type(format!(
                        "cannot union a {} with a {}",
                        a.kind(),
                        b.kind()
                    ))),
                },
                Expr::Call(name, args) => self.call(name, args, ctx),
                Expr::Path(path) => self.eval_path(path, ctx),
            }
        }

        fn eval_path(&self, path: &LocationPath, ctx: Ctx) -> Result<Value> {
            let mut current = vec![if path.absolute { 0 } else { ctx.node }];
            for (idx, step) in path.steps.iter().enumerate() {
                if step.yields_strings() {
                    if idx + 1 != path.steps.len() {
                        return Err(XPathError::Type(
                            "attribute and text() steps must end a path".into(),
                        ));
                    }
                    if !step.predicates.is_empty() {
                        return Err(XPathError::Type(
                            "predicates on attribute and text() steps are not supported".into(),
                        ));
                    }
                    let strings = current
                        .iter()
                        .flat_map(|&n| self.strings_for(n, step))
                        .collect();
                    return Ok(Value::Strings(strings));
                }

                let mut next = Vec::new();
                for &n in &current {
                    let candidates: Vec<usize> = self
                        .axis(n, step.axis)
                        .into_iter()
                        .filter(|&c| self.matches(c, &step.test))
                        .collect();
                    next.extend(self.filter(candidates, &step.predicates)?);
                }
                next.sort_unstable();
                next.dedup();
                current = next;
            }
            Ok(Value::Nodes(current))
        }

        /// Applies predicates in turn; positions are relative to axis order.
        fn filter(&self, mut nodes: Vec<usize>, predicates: &[Expr]) -> Result<Vec<usize>> {
            for pred in predicates {
                let size = nodes.len();
                let mut kept = Vec::with_capacity(size);
                for (i, &n) in nodes.iter().enumerate() {
                    let ctx = Ctx {
                        node: n,
                        position: i + 1,
                        size,
                    };
                    let keep = match self.eval(pred, ctx)? {
                        Value::Num(x) => x == (i + 1) as f64,
                        other => self.truthy(&other),
                    };
                    if keep {
                        kept.push(n);
                    }
                }
                nodes = kept;
            }
            Ok(nodes)
        }

        fn truthy(&self, v: &Value) -> bool {
            match v {
                Value::Nodes(ns) => !ns.is_empty(),
                Value::Strings(ss) => !ss.is_empty(),
                Value::Str(s) => !s.is_empty(),
                Value::Num(n) => *n != 0.0 && !n.is_nan(),
                Value::Bool(b) => *b,
            }
        }

        fn string(&self, v: &Value) -> String {
            match v {
                Value::Nodes(ns) => ns.first().map(|&n| self.string_value(n)).unwrap_or_default(),
                Value::Strings(ss) => ss.first().cloned().unwrap_or_default(),
                Value::Str(s) => s.clone(),
                Value::Num(n) => format_number(*n),
                Value::Bool(b) => b.to_string(),
            }
        }

        fn number(&self, v: &Value) -> f64 {
            match v {
                Value::Num(n) => *n,
                Value::Bool(b) => f64::from(u8::from(*b)),
                other => self.string(other).trim().parse().unwrap_or(f64::NAN),
            }
        }

        fn as_set(&self, v: &Value) -> Option<Vec<String>> {
            match v {
                Value::Nodes(ns) => Some(ns.iter().map(|&n| self.string_value(n)).collect()),
                Value::Strings(ss) => Some(ss.clone()),
                _ => None,
            }
        }

        fn compare(&self, op: CmpOp, l: &Value, r: &Value) -> bool {
            let eq = |same: bool| match op {
                CmpOp::Eq => same,
                CmpOp::Ne => !same,
            };
            match (self.as_set(l), self.as_set(r)) {
                (Some(ls), Some(rs)) => ls.iter().any(|a| rs.iter().any(|b| eq(a == b))),
                (Some(set), None) => self.compare_set(&set, l, r, eq),
                (None, Some(set)) => self.compare_set(&set, r, l, eq),
                (None, None) => match (l, r) {
                    (Value::Bool(_), _) | (_, Value::Bool(_)) => {
                        eq(self.truthy(l) == self.truthy(r))
                    }
                    (Value::Num(_), _) | (_, Value::Num(_)) => eq(self.number(l) == self.number(r)),
                    _ => eq(self.string(l) == self.string(r)),
                },
            }
        }

        fn compare_set(
            &self,
            set: &[String],
            raw: &Value,
            scalar: &Value,
            eq: impl Fn(bool) -> bool,
        ) -> bool {
            match scalar {
                Value::Bool(b) => eq(self.truthy(raw) == *b),
                Value::Num(n) => set
                    .iter()
                    .any(|s| eq(s.trim().parse::<f64>().is_ok_and(|x| x == *n))),
                other => {
                    let s = self.string(other);
                    set.iter().any(|a| eq(*a == s))
                }
            }
        }

        fn call(&self, name: &str, args: &[Expr], ctx: Ctx) -> Result<Value> {
            let arity = |min: usize, max: usize| {
                if args.len() < min || args.len() > max {
                    Err(XPathError::Type(format!(
                        "{name}() called with {} argument(s)",
                        args.len()
                    )))
                } else {
                    Ok(())
                }
            };
            let arg = |i: usize| self.eval(&args[i], ctx);
            let string_arg = |i: usize| -> Result<String> {
                match args.get(i) {
                    Some(e) => Ok(self.string(&self.eval(e, ctx)?)),
                    None => Ok(self.string_value(ctx.node)),
                }
            };

            match name {
                "position" => arity(0, 0).map(|_| Value::Num(ctx.position as f64)),
                "last" => arity(0, 0).map(|_| Value::Num(ctx.size as f64)),
                "true" => arity(0, 0).map(|_| Value::Bool(true)),
                "false" => arity(0, 0).map(|_| Value::Bool(false)),
                "not" => {
                    arity(1, 1)?;
                    Ok(Value::Bool(!self.truthy(&arg(0)?)))
                }
                "boolean" => {
                    arity(1, 1)?;
                    Ok(Value::Bool(self.truthy(&arg(0)?)))
                }
                "count" => {
                    arity(1, 1)?;
                    match arg(0)? {
                        Value::Nodes(ns) => Ok(Value::Num(ns.len() as f64)),
                        Value::Strings(ss) => Ok(Value::Num(ss.len() as f64)),
                        other => Err(XPathError::Type(format!(
                            "count() expects a node-set, got a {}",
                            other.kind()
                        ))),
                    }
                }
                "name" => {
                    arity(0, 1)?;
                    let node = match args.first() {
                        None => Some(ctx.node),
                        Some(e) => match self.eval(e, ctx)? {
                            Value::Nodes(ns) => ns.first().copied(),
                            other => {
                                return Err(XPathError::Type(format!(
                                    "name() expects a node-set, got a {}",
                                    other.kind()
                                )));
                            }
                        },
                    };
                    let name = node
                        .and_then(|n| self.slots[n].element)
                        .map(|e| e.name.clone())
                        .unwrap_or_default();
                    Ok(Value::Str(name))
                }
                "string" => {
                    arity(0, 1)?;
                    Ok(Value::Str(string_arg(0)?))
                }
                "string-length" => {
                    arity(0, 1)?;
                    Ok(Value::Num(string_arg(0)?.chars().count() as f64))
                }
                "normalize-space" => {
                    arity(0, 1)?;
                    let s = string_arg(0)?;
                    Ok(Value::Str(s.split_whitespace().collect::<Vec<_>>().join(" ")))
                }
                "number" => {
                    arity(0, 1)?;
                    let v = match args.first() {
                        Some(e) => self.eval(e, ctx)?,
                        None => Value::Str(self.string_value(ctx.node)),
                    };
                    Ok(Value::Num(self.number(&v)))
                }
                "contains" | "starts-with" | "ends-with" => {
                    arity(2, 2)?;
                    let hay = string_arg(0)?;
                    let needle = string_arg(1)?;
                    let hit = match name {
                        "contains" => hay.contains(&needle),
                        "starts-with" => hay.starts_with(&needle),
                        _ => hay.ends_with(&needle),
                    };
                    Ok(Value::Bool(hit))
                }
                "concat" => {
                    arity(2, usize::MAX)?;
                    let mut out = String::new();
                    for i in 0..args.len() {
                        out.push_str(&string_arg(i)?);
                    }
                    Ok(Value::Str(out))
                }
                _ => Err(XPathError::Type(format!("unknown function {name}()"))),
            }
        }
    }

    fn format_number(n: f64) -> String {
        if n.is_nan() {
            "NaN".to_string()
        } else if n.fract() == 0.0 && n.abs() < 1e15 {
            format!("{}", n as i64)
        } else {
            n.to_string()
        }
    }

    /* -------------------------------- API -------------------------------- */

    /// A compiled query.
    #[derive(Debug, Clone, PartialEq)]
    pub struct XPath {
        source: String,
        expr: Expr,
    }

    impl XPath {
        pub fn parse(query: &str) -> Result<Self> {
            match all_consuming(terminated(expr, multispace0))(query) {
                Ok((_, expr)) => Ok(Self {
                    source: query.to_string(),
                    expr,
                }),
                Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                    let message = match e.errors.first() {
                        Some((rest, _)) => format!(
                            "unexpected {:?} at offset {}",
                            rest,
                            query.len() - rest.len()
                        ),
                        None => "invalid query".to_string(),
                    };
                    Err(XPathError::Parse {
                        query: query.to_string(),
                        message,
                    })
                }
                Err(nom::Err::Incomplete(_)) => Err(XPathError::Parse {
                    query: query.to_string(),
                    message: "incomplete query".to_string(),
                }),
            }
        }

        pub fn as_str(&self) -> &str {
            &self.source
        }

        /// Elements matched under `root`, in document order.
        pub fn select<'e>(&self, root: &'e Element) -> Result<Vec<&'e Element>> {
            let flat = Flat::new(root);
            let ctx = Ctx {
                node: 0,
                position: 1,
                size: 1,
            };
            match flat.eval(&self.expr, ctx)? {
                Value::Nodes(ns) => Ok(ns.into_iter().filter_map(|n| flat.slots[n].element).collect()),
                other => Err(XPathError::Type(format!(
                    "query {:?} evaluates to a {}, not a node-set",
                    self.source,
                    other.kind()
                ))),
            }
        }
    }

    impl FromStr for XPath {
        type Err = XPathError;

        fn from_str(s: &str) -> Result<Self> {
            Self::parse(s)
        }
    }

    impl fmt::Display for XPath {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.source)
        }
    }

    pub fn select<'e>(root: &'e Element, query: &str) -> Result<Vec<&'e Element>> {
        XPath::parse(query)?.select(root)
    }

    /// Quotes `s` as an XPath string literal, falling back to `concat()` when it
    /// holds both quote characters.
    pub fn quote(s: &str) -> String {
        if !s.contains('\'') {
            format!("'{s}'")
        } else if !s.contains('"') {
            format!("\"{s}\"")
        } else {
            let parts: Vec<String> = s.split('\'').map(|p| format!("'{p}'")).collect();
            format!("concat({})", parts.join(", \"'\", "))
        }
    }

}

/* -------------------------- Structural queries -------------------------- */

pub mod projection {
    //! Maps an org subtree onto `xpath::Element`s and resolves query matches
    //! back to live nodes.
    //!
    //! Shape of the projection (`org` for ordinary nodes, `root` for the
    //! document root):
    //!
    //! ```text
    //! <org position="[{"child":0}]" heading="...">
    //!   <heading>..</heading> <level>2</level> <todo>TODO</todo> <priority>A</priority>
    //!   <tags><tag>..</tag></tags> <self_tags><tag>..</tag></self_tags>
    //!   <properties><property name="ID">..</property></properties>
    //!   <contents>
    //!     <text position="..">..</text>
    //!     <table position=".."/>
    //!   </contents>
    //!   <children><org ..>..</org></children>
    //! </org>
    //! ```
    //!
    //! Only `root`, `org`, `text` and `table` carry a position. `created` is not
    //! projected since deriving it can fail.

    use crate::core::{OrgError, PositionId, Tag};
    use crate::tree::{Content, Org, OrgDocument, Selected};
    use crate::xpath::{self, Element, XPath};
    use std::collections::BTreeSet;

    const POSITION: &str = "position";

    fn encode(position: &PositionId) -> Result<String, OrgError> {
        Ok(serde_json::to_string(position)?)
    }

    fn tag_list(name: &str, tags: BTreeSet<Tag>) -> Element {
        tags.into_iter().fold(Element::new(name), |el, t| {
            el.with_child(Element::new("tag").with_text(t.0))
        })
    }

    fn project_content(content: &Content<'_>) -> Result<Element, OrgError> {
        let el = match content {
            Content::Text(t) => Element::new("text").with_text(t.text),
            // opaque leaf; cells are read from the resolved `Table`
            Content::Table(_) => Element::new("table"),
        };
        Ok(el.with_attribute(POSITION, encode(content.position())?))
    }

    fn project_node(node: &Org<'_>) -> Result<Element, OrgError> {
        let name = if node.is_root() { "root" } else { "org" };
        let mut el = Element::new(name)
            .with_attribute(POSITION, encode(node.position())?)
            .with_attribute("heading", node.heading())
            .with_child(Element::new("heading").with_text(node.heading()))
            .with_child(Element::new("level").with_text(node.level().to_string()));
        if let Some(todo) = node.todo() {
            el.push(Element::new("todo").with_text(todo));
        }
        if let Some(priority) = node.priority() {
            el.push(Element::new("priority").with_text(priority.to_string()));
        }
        el.push(tag_list("tags", node.tags()));
        el.push(tag_list("self_tags", node.self_tags()));

        let mut properties = Element::new("properties");
        for (key, value) in node.properties() {
            properties.push(
                Element::new("property")
                    .with_attribute("name", key)
                    .with_text(value),
            );
        }
        el.push(properties);

        let mut contents = Element::new("contents");
        for content in node.contents() {
            contents.push(project_content(&content)?);
        }
        el.push(contents);

        let mut children = Element::new("children");
        for child in node.children() {
            children.push(project_node(&child)?);
        }
        el.push(children);
        Ok(el)
    }

    impl<'a> Org<'a> {
        /// This node and its subtree as a generic element tree.
        pub fn project(&self) -> Result<Element, OrgError> {
            project_node(self)
        }

        /// Runs `query` over this subtree and resolves every match, in document
        /// order. Positions are always replayed from the document root.
        pub fn select_all(&self, query: &str) -> Result<Vec<Selected<'a>>, OrgError> {
            let compiled = XPath::parse(query)?;
            let projected = self.project()?;
            let matches = compiled.select(&projected)?;
            tracing::debug!(query, matches = matches.len(), "structural query");
            matches
                .into_iter()
                .map(|el| self.resolve_element(el))
                .collect()
        }

        fn resolve_element(&self, el: &Element) -> Result<Selected<'a>, OrgError> {
            let encoded = el
                .attribute(POSITION)
                .ok_or_else(|| OrgError::Unresolvable {
                    element: el.name.clone(),
                })?;
            let position: PositionId = serde_json::from_str(encoded)?;
            self.document().resolve(&position)
        }

        /// Nodes matching `query`; matching a table or text fragment is an error.
        pub fn xpath_all(&self, query: &str) -> Result<Vec<Org<'a>>, OrgError> {
            self.select_all(query)?
                .into_iter()
                .map(|sel| match sel {
                    Selected::Node(node) => Ok(node),
                    other => Err(OrgError::NotANode {
                        query: query.to_string(),
                        kind: other.kind().to_string(),
                    }),
                })
                .collect()
        }

        /// The single node matching `query`.
        pub fn xpath(&self, query: &str) -> Result<Org<'a>, OrgError> {
            let mut found = self.xpath_all(query)?;
            if found.len() != 1 {
                return Err(OrgError::AmbiguousOrUnmatchedQuery {
                    query: query.to_string(),
                    count: found.len(),
                });
            }
            Ok(found.remove(0))
        }

        /// Nodes in this subtree carrying `tag`, either declared on the node or
        /// (with `with_inherited`) anywhere up the tree.
        pub fn with_tag(&self, tag: &str, with_inherited: bool) -> Result<Vec<Org<'a>>, OrgError> {
            let field = if with_inherited { "tags" } else { "self_tags" };
            self.xpath_all(&format!(
                "//org[{field}/tag[text()={}]]",
                xpath::quote(tag)
            ))
        }

        /// The document root's direct children.
        pub fn firstlevel(&self) -> Result<Vec<Org<'a>>, OrgError> {
            self.document().root().xpath_all("/root/children/org")
        }
    }

    impl OrgDocument {
        pub fn xpath_all(&self, query: &str) -> Result<Vec<Org<'_>>, OrgError> {
            self.root().xpath_all(query)
        }

        pub fn xpath(&self, query: &str) -> Result<Org<'_>, OrgError> {
            self.root().xpath(query)
        }

        pub fn with_tag(&self, tag: &str, with_inherited: bool) -> Result<Vec<Org<'_>>, OrgError> {
            self.root().with_tag(tag, with_inherited)
        }

        pub fn firstlevel(&self) -> Result<Vec<Org<'_>>, OrgError> {
            self.root().firstlevel()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const DOC: &str = "#+FILETAGS: :top:
* Projects :work:
** Alpha :urgent:
:PROPERTIES:
:ID: alpha-1
:END:
| name  | qty |
|-------+-----|
| bolts | 4   |
notes after
** Beta
* Personal
** TAGS TEST heading :work:
";

        fn headings(nodes: &[Org<'_>]) -> Vec<String> {
            nodes.iter().map(|n| n.heading().to_string()).collect()
        }

        #[test]
        fn root_and_org_are_distinct() {
            let doc = OrgDocument::from_string(DOC).unwrap();
            let roots = doc.root().select_all("//root").unwrap();
            assert_eq!(roots, vec![Selected::Node(doc.root())]);
            assert_eq!(doc.xpath_all("//org").unwrap().len(), 5);
            assert!(doc.xpath_all("//org/children/root").unwrap().is_empty());
        }

        #[test]
        fn firstlevel_lists_top_headings() {
            let doc = OrgDocument::from_string(DOC).unwrap();
            let top = doc.firstlevel().unwrap();
            assert_eq!(headings(&top), vec!["Projects", "Personal"]);
            // same answer from anywhere in the tree
            let beta = doc.xpath("//org[heading='Beta']").unwrap();
            assert_eq!(beta.firstlevel().unwrap(), top);
        }

        #[test]
        fn singleton_queries() {
            let doc = OrgDocument::from_string(DOC).unwrap();
            let node = doc.xpath("//org[contains(heading, 'TAGS TEST')]").unwrap();
            assert_eq!(node.heading(), "TAGS TEST heading");
            assert_eq!(doc.xpath("//org[@heading='Alpha']").unwrap().level(), 2);

            match doc.xpath("//org") {
                Err(OrgError::AmbiguousOrUnmatchedQuery { count, .. }) => assert_eq!(count, 5),
                other => panic!("unexpected {other:?}"),
            }
            match doc.xpath("//org[heading='nope']") {
                Err(OrgError::AmbiguousOrUnmatchedQuery { count, .. }) => assert_eq!(count, 0),
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn with_tag_respects_inheritance() {
            let doc = OrgDocument::from_string(DOC).unwrap();
            assert_eq!(
                headings(&doc.with_tag("work", false).unwrap()),
                vec!["Projects", "TAGS TEST heading"]
            );
            assert_eq!(
                headings(&doc.with_tag("work", true).unwrap()),
                vec!["Projects", "Alpha", "Beta", "TAGS TEST heading"]
            );
            assert_eq!(doc.with_tag("top", true).unwrap().len(), 5);
            assert!(doc.with_tag("top", false).unwrap().is_empty());
            assert!(doc.with_tag("it's", true).unwrap().is_empty());
        }

        #[test]
        fn tables_and_text_resolve_to_contents() {
            let doc = OrgDocument::from_string(DOC).unwrap();
            let root = doc.root();

            let tables = root.select_all("//table").unwrap();
            assert_eq!(tables.len(), 1);
            let Selected::Table(table) = &tables[0] else {
                panic!("expected a table, got {:?}", tables[0]);
            };
            assert_eq!(table.get(0, "qty"), Some("4"));
            assert_eq!(table.position().to_string(), "/child[0]/child[0]/content[0]");

            let texts = root
                .select_all("//org[heading='Alpha']/contents/text")
                .unwrap();
            assert_eq!(texts.len(), 1);
            match &texts[0] {
                Selected::Text(t) => assert_eq!(t.text, "notes after"),
                other => panic!("unexpected {other:?}"),
            }

            let alpha = doc.xpath("//org[contents/table]").unwrap();
            assert_eq!(alpha.heading(), "Alpha");
            assert!(root.select_all("//table/*").unwrap().is_empty());
            let by_prop = doc
                .xpath("//org[properties/property[@name='ID']='alpha-1']")
                .unwrap();
            assert_eq!(by_prop, alpha);
        }

        #[test]
        fn non_node_matches_are_rejected() {
            let doc = OrgDocument::from_string(DOC).unwrap();
            match doc.xpath_all("//table") {
                Err(OrgError::NotANode { kind, .. }) => assert_eq!(kind, "table"),
                other => panic!("unexpected {other:?}"),
            }
            match doc.root().select_all("//org/heading") {
                Err(OrgError::Unresolvable { element }) => assert_eq!(element, "heading"),
                other => panic!("unexpected {other:?}"),
            }
            assert!(matches!(
                doc.xpath_all("//org[").unwrap_err(),
                OrgError::Query(xpath::XPathError::Parse { .. })
            ));
        }

        #[test]
        fn resolution_is_idempotent() {
            let doc = OrgDocument::from_string(DOC).unwrap();
            for node in doc.xpath_all("//org").unwrap() {
                let again = doc.resolve(node.position()).unwrap();
                assert_eq!(again, Selected::Node(node.clone()));
                assert_eq!(again.into_node().unwrap().heading(), node.heading());
            }
        }

        #[test]
        fn subtree_queries_keep_root_positions() {
            let doc = OrgDocument::from_string(DOC).unwrap();
            let projects = doc.xpath("/root/children/org[1]").unwrap();
            let found = projects.xpath_all("//org").unwrap();
            assert_eq!(headings(&found), vec!["Projects", "Alpha", "Beta"]);
            assert_eq!(found[1].position().to_string(), "/child[0]/child[0]");
            assert!(projects.xpath_all("//root").unwrap().is_empty());
        }
    }
}

pub use crate::config::OrgOptions;
pub use crate::core::{OrgDate, OrgError, PositionId, Step};
pub use crate::dates::parse_org_date;
pub use crate::table::Table;
pub use crate::tree::{Org, OrgDocument};
