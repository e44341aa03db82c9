//! Task grouping library for query results.
//! Derives display-ready group keys from task properties and nests matched tasks
//! into insertion-ordered group trees, one level per `group by` instruction.

pub mod core {
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    /* ------------------------------- Status ------------------------------- */

    /// Checkbox status of a task: the character between the brackets plus a display name.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Status {
        pub indicator: String,
        #[serde(default)]
        pub name: String,
    }

    impl Status {
        pub fn new(indicator: impl Into<String>, name: impl Into<String>) -> Self {
            Self {
                indicator: indicator.into(),
                name: name.into(),
            }
        }

        pub fn todo() -> Self {
            Self::new(" ", "Todo")
        }

        pub fn done() -> Self {
            Self::new("x", "Done")
        }

        /// True only for the blank `[ ]` checkbox; every custom state counts as not-todo.
        pub fn is_todo(&self) -> bool {
            self.indicator == " "
        }
    }

    impl Default for Status {
        fn default() -> Self {
            Self::todo()
        }
    }

    /* ------------------------------ Priority ------------------------------ */

    /// Priority stored as its one-character rank code.
    /// Ranks order High ('1') before Medium, None and Low; None is the default.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Priority(pub char);

    impl Priority {
        pub const HIGH: Priority = Priority('1');
        pub const MEDIUM: Priority = Priority('2');
        pub const NONE: Priority = Priority('3');
        pub const LOW: Priority = Priority('4');

        /// Display name, or `None` for a code outside the four known ranks.
        pub fn name(self) -> Option<&'static str> {
            match self.0 {
                '1' => Some("High"),
                '2' => Some("Medium"),
                '3' => Some("None"),
                '4' => Some("Low"),
                _ => None,
            }
        }
    }

    impl Default for Priority {
        fn default() -> Self {
            Self::NONE
        }
    }

    /* ----------------------------- Recurrence ----------------------------- */

    /// Recurrence rule in its textual form, e.g. `every week on Monday`.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Recurrence(pub String);

    impl Recurrence {
        pub fn new(rule: impl Into<String>) -> Self {
            Self(rule.into())
        }

        pub fn to_text(&self) -> &str {
            &self.0
        }
    }

    /* -------------------------------- Task -------------------------------- */

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct LinkTextOptions {
        /// When set, the bare file name identifies the note; otherwise the full path is used.
        pub filename_is_unique: bool,
    }

    /// Immutable snapshot of one task as extracted from a note.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Task {
        pub description: String,

        #[serde(default)]
        pub status: Status,

        #[serde(default)]
        pub priority: Priority,

        #[serde(default)]
        pub start_date: Option<NaiveDate>,
        #[serde(default)]
        pub scheduled_date: Option<NaiveDate>,
        #[serde(default)]
        pub due_date: Option<NaiveDate>,
        #[serde(default)]
        pub done_date: Option<NaiveDate>,

        #[serde(default)]
        pub recurrence: Option<Recurrence>,

        /// Tags in the order they appear in the task line, including the leading `#`.
        #[serde(default)]
        pub tags: Vec<String>,

        /// Vault-relative path of the note containing the task; empty when unknown.
        #[serde(default)]
        pub path: String,

        /// Nearest heading above the task line.
        #[serde(default)]
        pub preceding_heading: Option<String>,
    }

    impl Task {
        pub fn new(description: impl Into<String>) -> Self {
            Self {
                description: description.into(),
                ..Self::default()
            }
        }

        /// File name without the `.md` extension, or `None` when the origin is unknown.
        pub fn filename(&self) -> Option<&str> {
            let last = self.path.rsplit('/').next()?;
            last.strip_suffix(".md").filter(|name| !name.is_empty())
        }

        /// Preceding heading, treating an empty heading as absent.
        pub fn heading(&self) -> Option<&str> {
            self.preceding_heading
                .as_deref()
                .filter(|heading| !heading.is_empty())
        }

        /// Earliest of the start, scheduled and due dates.
        pub fn happens_date(&self) -> Option<NaiveDate> {
            [self.start_date, self.scheduled_date, self.due_date]
                .into_iter()
                .flatten()
                .min()
        }

        pub fn is_recurring(&self) -> bool {
            self.recurrence.is_some()
        }

        /// Link text for the task's location (`file > heading`), `None` when nothing is known.
        pub fn link_text(&self, options: LinkTextOptions) -> Option<String> {
            let mut text = if options.filename_is_unique {
                self.filename()?.to_string()
            } else if self.path.is_empty() {
                return None;
            } else {
                format!("/{}", self.path)
            };
            if let Some(heading) = self.heading() {
                if heading != text {
                    text.push_str(" > ");
                    text.push_str(heading);
                }
            }
            Some(text)
        }
    }

}

pub mod markdown {
    //! Markdown escaping for group keys built from free text.

    /// Escape `\` and `_` so file and folder names render literally.
    pub fn escape_markdown_characters(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '_' => out.push_str("\\_"),
                _ => out.push(c),
            }
        }
        out
    }

}

pub mod group {
    //! Group key derivation: one rule per groupable task property.
    //!
    //! Every property yields exactly one key except `tags`, which yields one key per
    //! tag so a task can be placed in several groups. Keys are display-ready: file
    //! and folder names are Markdown-escaped, headings and tags are kept as authored.

    use crate::core::{LinkTextOptions, Task};
    use crate::markdown::escape_markdown_characters;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    pub const UNKNOWN_LOCATION: &str = "Unknown Location";
    pub const NO_HEADING: &str = "(No heading)";
    pub const NO_TAGS: &str = "(No tags)";

    /* ------------------------------ Properties ------------------------------ */

    /// Closed set of properties a query can group by.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum GroupingProperty {
        Backlink,
        Done,
        Due,
        Filename,
        Folder,
        Happens,
        Heading,
        Path,
        Priority,
        Recurrence,
        Recurring,
        Root,
        Scheduled,
        Start,
        Status,
        Tags,
    }

    impl GroupingProperty {
        pub const ALL: [GroupingProperty; 16] = [
            GroupingProperty::Backlink,
            GroupingProperty::Done,
            GroupingProperty::Due,
            GroupingProperty::Filename,
            GroupingProperty::Folder,
            GroupingProperty::Happens,
            GroupingProperty::Heading,
            GroupingProperty::Path,
            GroupingProperty::Priority,
            GroupingProperty::Recurrence,
            GroupingProperty::Recurring,
            GroupingProperty::Root,
            GroupingProperty::Scheduled,
            GroupingProperty::Start,
            GroupingProperty::Status,
            GroupingProperty::Tags,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                GroupingProperty::Backlink => "backlink",
                GroupingProperty::Done => "done",
                GroupingProperty::Due => "due",
                GroupingProperty::Filename => "filename",
                GroupingProperty::Folder => "folder",
                GroupingProperty::Happens => "happens",
                GroupingProperty::Heading => "heading",
                GroupingProperty::Path => "path",
                GroupingProperty::Priority => "priority",
                GroupingProperty::Recurrence => "recurrence",
                GroupingProperty::Recurring => "recurring",
                GroupingProperty::Root => "root",
                GroupingProperty::Scheduled => "scheduled",
                GroupingProperty::Start => "start",
                GroupingProperty::Status => "status",
                GroupingProperty::Tags => "tags",
            }
        }

        /// Whether one task can produce more than one key for this property.
        pub fn is_multi_valued(self) -> bool {
            matches!(self, GroupingProperty::Tags)
        }

        pub fn names_for_task(self, task: &Task) -> Vec<String> {
            names_for_task(self, task)
        }

        fn supported_list() -> String {
            Self::ALL
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        }
    }

    impl fmt::Display for GroupingProperty {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for GroupingProperty {
        type Err = GroupingError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let wanted = s.trim();
            Self::ALL
                .into_iter()
                .find(|p| p.as_str().eq_ignore_ascii_case(wanted))
                .ok_or_else(|| GroupingError::UnknownProperty(wanted.to_string()))
        }
    }

    /* -------------------------------- Errors -------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum GroupingError {
        #[error("unknown grouping property {0:?} (supported: {})", GroupingProperty::supported_list())]
        UnknownProperty(String),
        #[error("invalid grouping instruction {0:?}; expected `group by <property>`")]
        InvalidInstruction(String),
        #[error("key path has {found} keys but the tree groups by {expected} properties")]
        KeyPathLength { expected: usize, found: usize },
        #[error("line {line}: {source}")]
        AtLine {
            line: usize,
            #[source]
            source: Box<GroupingError>,
        },
    }

    /* ------------------------------- Options -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GroupingOptions {
        /// Backlink keys drop a heading that merely repeats the file name.
        pub collapse_heading_matching_filename: bool,
    }

    impl Default for GroupingOptions {
        fn default() -> Self {
            Self {
                collapse_heading_matching_filename: true,
            }
        }
    }

    /* ------------------------------ Derivation ------------------------------ */

    /// Group keys for `task` under `property`, using default options.
    pub fn names_for_task(property: GroupingProperty, task: &Task) -> Vec<String> {
        names_for_task_with(property, task, &GroupingOptions::default())
    }

    pub fn names_for_task_with(
        property: GroupingProperty,
        task: &Task,
        options: &GroupingOptions,
    ) -> Vec<String> {
        match property {
            GroupingProperty::Backlink => vec![backlink_name(task, options)],
            GroupingProperty::Done => vec![date_name(task.done_date, "done")],
            GroupingProperty::Due => vec![date_name(task.due_date, "due")],
            GroupingProperty::Filename => vec![filename_name(task)],
            GroupingProperty::Folder => vec![folder_name(task)],
            GroupingProperty::Happens => vec![date_name(task.happens_date(), "happens")],
            GroupingProperty::Heading => vec![heading_name(task)],
            GroupingProperty::Path => vec![path_name(task)],
            GroupingProperty::Priority => vec![priority_name(task)],
            GroupingProperty::Recurrence => vec![recurrence_name(task)],
            GroupingProperty::Recurring => vec![recurring_name(task)],
            GroupingProperty::Root => vec![root_name(task)],
            GroupingProperty::Scheduled => vec![date_name(task.scheduled_date, "scheduled")],
            GroupingProperty::Start => vec![date_name(task.start_date, "start")],
            GroupingProperty::Status => vec![status_name(task)],
            GroupingProperty::Tags => tag_names(task),
        }
    }

    fn date_name(date: Option<NaiveDate>, field: &str) -> String {
        match date {
            Some(date) => date.format("%Y-%m-%d %A").to_string(),
            None => format!("No {field} date"),
        }
    }

    fn priority_name(task: &Task) -> String {
        let name = task.priority.name().unwrap_or("ERROR");
        format!("Priority {}: {}", task.priority.0, name)
    }

    fn recurrence_name(task: &Task) -> String {
        match &task.recurrence {
            Some(rule) => rule.to_text().to_string(),
            None => "None".to_string(),
        }
    }

    fn recurring_name(task: &Task) -> String {
        if task.is_recurring() {
            "Recurring".to_string()
        } else {
            "Not Recurring".to_string()
        }
    }

    fn path_name(task: &Task) -> String {
        let path = task.path.strip_suffix(".md").unwrap_or(&task.path);
        escape_markdown_characters(path)
    }

    fn folder_name(task: &Task) -> String {
        match task.path.rfind('/') {
            Some(idx) => escape_markdown_characters(&task.path[..=idx]),
            None => "/".to_string(),
        }
    }

    fn filename_name(task: &Task) -> String {
        match task.filename() {
            Some(name) => format!("[[{}]]", escape_markdown_characters(name)),
            None => UNKNOWN_LOCATION.to_string(),
        }
    }

    fn root_name(task: &Task) -> String {
        let path = task.path.replace('\\', "/");
        match path.find('/') {
            Some(idx) => escape_markdown_characters(&path[..=idx]),
            None => "/".to_string(),
        }
    }

    fn backlink_name(task: &Task, options: &GroupingOptions) -> String {
        let unique = LinkTextOptions {
            filename_is_unique: true,
        };
        if task.link_text(unique).is_none() {
            return UNKNOWN_LOCATION.to_string();
        }
        let filename = task
            .filename()
            .map(escape_markdown_characters)
            .unwrap_or_else(|| UNKNOWN_LOCATION.to_string());
        match task.heading() {
            None => filename,
            Some(heading) if options.collapse_heading_matching_filename && heading == filename => {
                filename
            }
            Some(heading) => format!("{filename} > {heading}"),
        }
    }

    // Legacy two-state grouping: any indicator other than a space counts as done.
    fn status_name(task: &Task) -> String {
        if task.status.is_todo() {
            "Todo".to_string()
        } else {
            "Done".to_string()
        }
    }

    fn heading_name(task: &Task) -> String {
        task.heading().unwrap_or(NO_HEADING).to_string()
    }

    fn tag_names(task: &Task) -> Vec<String> {
        if task.tags.is_empty() {
            vec![NO_TAGS.to_string()]
        } else {
            task.tags.clone()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{Priority, Recurrence, Status};

        fn ymd(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
            NaiveDate::from_ymd_opt(y, m, d)
        }

        fn at(path: &str) -> Task {
            let mut task = Task::new("task");
            task.path = path.to_string();
            task
        }

        fn one(property: GroupingProperty, task: &Task) -> String {
            let names = names_for_task(property, task);
            assert_eq!(names.len(), 1, "{property} should yield one key");
            names.into_iter().next().expect("one key")
        }

        #[test]
        fn every_single_valued_property_yields_one_key() {
            let mut bare = Task::new("bare");
            bare.tags = vec!["#a".into(), "#b".into()];
            let mut full = at("a_b/c\\d/note_1.md");
            full.due_date = ymd(2023, 5, 31);
            full.recurrence = Some(Recurrence::new("every day"));
            full.preceding_heading = Some("Section".into());
            for task in [&bare, &full] {
                for property in GroupingProperty::ALL {
                    if property.is_multi_valued() {
                        continue;
                    }
                    assert_eq!(names_for_task(property, task).len(), 1, "{property}");
                }
            }
        }

        #[test]
        fn property_identifiers_parse_case_insensitively() {
            for property in GroupingProperty::ALL {
                let upper = property.as_str().to_uppercase();
                assert_eq!(upper.parse::<GroupingProperty>(), Ok(property));
            }
            assert_eq!(
                "urgency".parse::<GroupingProperty>(),
                Err(GroupingError::UnknownProperty("urgency".into()))
            );
        }

        #[test]
        fn missing_dates_use_field_name() {
            let task = Task::new("no dates");
            assert_eq!(one(GroupingProperty::Due, &task), "No due date");
            assert_eq!(one(GroupingProperty::Start, &task), "No start date");
            assert_eq!(one(GroupingProperty::Scheduled, &task), "No scheduled date");
            assert_eq!(one(GroupingProperty::Done, &task), "No done date");
            assert_eq!(one(GroupingProperty::Happens, &task), "No happens date");
        }

        #[test]
        fn dates_format_with_weekday() {
            let mut task = Task::new("dated");
            task.due_date = ymd(2023, 5, 31);
            task.scheduled_date = ymd(2023, 6, 1);
            assert_eq!(one(GroupingProperty::Due, &task), "2023-05-31 Wednesday");
            assert_eq!(
                one(GroupingProperty::Scheduled, &task),
                "2023-06-01 Thursday"
            );
            assert_eq!(one(GroupingProperty::Happens, &task), "2023-05-31 Wednesday");
        }

        #[test]
        fn priority_keys_include_rank_and_name() {
            let mut task = Task::new("p");
            task.priority = Priority::HIGH;
            assert_eq!(one(GroupingProperty::Priority, &task), "Priority 1: High");
            task.priority = Priority::MEDIUM;
            assert_eq!(one(GroupingProperty::Priority, &task), "Priority 2: Medium");
            task.priority = Priority::NONE;
            assert_eq!(one(GroupingProperty::Priority, &task), "Priority 3: None");
            task.priority = Priority::LOW;
            assert_eq!(one(GroupingProperty::Priority, &task), "Priority 4: Low");
            task.priority = Priority('9');
            assert_eq!(one(GroupingProperty::Priority, &task), "Priority 9: ERROR");
        }

        #[test]
        fn recurrence_and_recurring() {
            let mut task = Task::new("r");
            assert_eq!(one(GroupingProperty::Recurrence, &task), "None");
            assert_eq!(one(GroupingProperty::Recurring, &task), "Not Recurring");
            task.recurrence = Some(Recurrence::new("every week on Monday"));
            assert_eq!(
                one(GroupingProperty::Recurrence, &task),
                "every week on Monday"
            );
            assert_eq!(one(GroupingProperty::Recurring, &task), "Recurring");
        }

        #[test]
        fn status_is_two_state() {
            let mut task = Task::new("s");
            assert_eq!(one(GroupingProperty::Status, &task), "Todo");
            task.status = Status::done();
            assert_eq!(one(GroupingProperty::Status, &task), "Done");
            task.status = Status::new("/", "In Progress");
            assert_eq!(one(GroupingProperty::Status, &task), "Done");
            task.status = Status::new("-", "Cancelled");
            assert_eq!(one(GroupingProperty::Status, &task), "Done");
        }

        #[test]
        fn path_keys_are_escaped() {
            let task = at("a_b/c\\d/note_1.md");
            assert_eq!(one(GroupingProperty::Path, &task), "a\\_b/c\\\\d/note\\_1");
            assert_eq!(one(GroupingProperty::Folder, &task), "a\\_b/c\\\\d/");
            assert_eq!(one(GroupingProperty::Filename, &task), "[[note\\_1]]");
            assert_eq!(one(GroupingProperty::Root, &task), "a\\_b/");
        }

        #[test]
        fn folder_and_root_fall_back_to_vault_root() {
            let task = at("top.md");
            assert_eq!(one(GroupingProperty::Folder, &task), "/");
            assert_eq!(one(GroupingProperty::Root, &task), "/");
            assert_eq!(one(GroupingProperty::Path, &task), "top");
        }

        #[test]
        fn root_normalizes_backslash_separators() {
            let task = at("inbox\\later\\note.md");
            assert_eq!(one(GroupingProperty::Root, &task), "inbox/");
        }

        #[test]
        fn filename_unknown_location() {
            let task = Task::new("orphan");
            assert_eq!(one(GroupingProperty::Filename, &task), UNKNOWN_LOCATION);
            assert_eq!(one(GroupingProperty::Backlink, &task), UNKNOWN_LOCATION);
        }

        #[test]
        fn backlink_combines_filename_and_unescaped_heading() {
            let mut task = at("projects/my_plan.md");
            assert_eq!(one(GroupingProperty::Backlink, &task), "my\\_plan");

            task.preceding_heading = Some("Next _steps_".into());
            assert_eq!(
                one(GroupingProperty::Backlink, &task),
                "my\\_plan > Next _steps_"
            );

            task.preceding_heading = Some(String::new());
            assert_eq!(one(GroupingProperty::Backlink, &task), "my\\_plan");
        }

        #[test]
        fn backlink_collapse_is_configurable() {
            let mut task = at("notes/Plan.md");
            task.preceding_heading = Some("Plan".into());
            assert_eq!(one(GroupingProperty::Backlink, &task), "Plan");

            let keep = GroupingOptions {
                collapse_heading_matching_filename: false,
            };
            assert_eq!(
                names_for_task_with(GroupingProperty::Backlink, &task, &keep),
                vec!["Plan > Plan".to_string()]
            );
        }

        #[test]
        fn heading_is_not_escaped() {
            let mut task = Task::new("h");
            assert_eq!(one(GroupingProperty::Heading, &task), NO_HEADING);
            task.preceding_heading = Some(String::new());
            assert_eq!(one(GroupingProperty::Heading, &task), NO_HEADING);
            task.preceding_heading = Some("snake_case \\ heading".into());
            assert_eq!(
                one(GroupingProperty::Heading, &task),
                "snake_case \\ heading"
            );
        }

        #[test]
        fn tags_fan_out_in_authored_order() {
            let mut task = Task::new("t");
            assert_eq!(
                names_for_task(GroupingProperty::Tags, &task),
                vec![NO_TAGS.to_string()]
            );
            task.tags = vec!["#b".into(), "#a_z".into()];
            assert_eq!(
                GroupingProperty::Tags.names_for_task(&task),
                vec!["#b".to_string(), "#a_z".to_string()]
            );
        }
    }
}

pub mod query {
    //! `group by` instruction parsing built on `nom`.
    //! Identifiers are validated here so the tree builder only ever sees known properties.

    use crate::group::{GroupingError, GroupingProperty};
    use nom::{
        IResult,
        bytes::complete::{tag_no_case, take_while1},
        character::complete::{space0, space1},
        combinator::all_consuming,
        sequence::{delimited, tuple},
    };
    use tracing::debug;

    fn group_by_instruction(i: &str) -> IResult<&str, &str> {
        let (i, _) = tuple((space0, tag_no_case("group"), space1, tag_no_case("by"), space1))(i)?;
        delimited(
            space0,
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
            space0,
        )(i)
    }

    /// Parse a single `group by <property>` line.
    pub fn parse_group_by(line: &str) -> Result<GroupingProperty, GroupingError> {
        let (_, name) = all_consuming(group_by_instruction)(line)
            .map_err(|_| GroupingError::InvalidInstruction(line.trim().to_string()))?;
        name.parse()
    }

    /// Parse one instruction per line; blank lines and `#` comments are skipped.
    /// The returned order is the nesting order, outermost first.
    pub fn parse_grouping_instructions(
        text: &str,
    ) -> Result<Vec<GroupingProperty>, GroupingError> {
        let dimensions = text
            .lines()
            .enumerate()
            .filter(|(_, line)| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with('#')
            })
            .map(|(idx, line)| {
                parse_group_by(line).map_err(|err| GroupingError::AtLine {
                    line: idx + 1,
                    source: Box::new(err),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(?dimensions, "parsed grouping instructions");
        Ok(dimensions)
    }

}

pub mod paths {
    //! Key-path construction: one key per grouping dimension, fanned out over
    //! multi-valued dimensions.

    use crate::core::Task;
    use crate::group::{GroupingOptions, GroupingProperty, names_for_task_with};

    /// Ordered keys locating a leaf group, outermost dimension first.
    pub type KeyPath = Vec<String>;

    pub fn paths_for_task(dimensions: &[GroupingProperty], task: &Task) -> Vec<KeyPath> {
        paths_for_task_with(dimensions, task, &GroupingOptions::default())
    }

    /// Every key-path for `task`: the product of each dimension's keys, in dimension
    /// order and per-dimension key order. No dimensions gives one empty path.
    pub fn paths_for_task_with(
        dimensions: &[GroupingProperty],
        task: &Task,
        options: &GroupingOptions,
    ) -> Vec<KeyPath> {
        let mut paths: Vec<KeyPath> = vec![Vec::with_capacity(dimensions.len())];
        for &dimension in dimensions {
            let names = names_for_task_with(dimension, task, options);
            if let [name] = names.as_slice() {
                for path in &mut paths {
                    path.push(name.clone());
                }
                continue;
            }
            paths = paths
                .iter()
                .flat_map(|prefix| {
                    names.iter().map(move |name| {
                        let mut path = prefix.clone();
                        path.push(name.clone());
                        path
                    })
                })
                .collect();
        }
        paths
    }

}

pub mod tree {
    //! Hierarchical group tree.
    //!
    //! Keys at every level keep the order in which they were first seen, so the
    //! grouping reflects the order of the already-sorted input and is never
    //! re-sorted here. A tree is built per query evaluation and then flattened
    //! into [`TaskGroups`] for display.

    use crate::core::Task;
    use crate::group::{GroupingError, GroupingOptions, GroupingProperty};
    use crate::paths::{KeyPath, paths_for_task_with};
    use indexmap::IndexMap;
    use serde::Serialize;
    use tracing::{debug, trace};

    #[derive(Debug, Default)]
    struct GroupNode<'a> {
        tasks: Vec<&'a Task>,
        children: IndexMap<String, GroupNode<'a>>,
    }

    /// Tasks nested under one level of keys per grouping dimension.
    #[derive(Debug)]
    pub struct GroupTree<'a> {
        dimensions: Vec<GroupingProperty>,
        root: GroupNode<'a>,
    }

    impl<'a> GroupTree<'a> {
        pub fn new(dimensions: &[GroupingProperty]) -> Self {
            Self {
                dimensions: dimensions.to_vec(),
                root: GroupNode::default(),
            }
        }

        /// Build a tree from `tasks` in their given order.
        pub fn from_tasks(
            dimensions: &[GroupingProperty],
            tasks: &'a [Task],
            options: &GroupingOptions,
        ) -> Self {
            debug!(?dimensions, tasks = tasks.len(), "building group tree");
            let mut tree = Self::new(dimensions);
            for task in tasks {
                tree.add_task(task, options);
            }
            tree
        }

        pub fn dimensions(&self) -> &[GroupingProperty] {
            &self.dimensions
        }

        /// Place `task` under every key-path its properties produce.
        pub fn add_task(&mut self, task: &'a Task, options: &GroupingOptions) {
            for path in paths_for_task_with(&self.dimensions, task, options) {
                self.place(task, &path);
            }
        }

        /// Add `task` under `key_path`, creating nodes on first use.
        /// The path must hold exactly one key per dimension.
        pub fn insert(&mut self, task: &'a Task, key_path: &[String]) -> Result<(), GroupingError> {
            if key_path.len() != self.dimensions.len() {
                return Err(GroupingError::KeyPathLength {
                    expected: self.dimensions.len(),
                    found: key_path.len(),
                });
            }
            self.place(task, key_path);
            Ok(())
        }

        fn place(&mut self, task: &'a Task, key_path: &[String]) {
            trace!(?key_path, description = %task.description, "insert");
            let mut node = &mut self.root;
            for key in key_path {
                node = node.children.entry(key.clone()).or_default();
            }
            node.tasks.push(task);
        }

        /// Leaf groups depth-first in insertion order, each with its full key-path.
        pub fn render(&self) -> Vec<(KeyPath, Vec<&'a Task>)> {
            let mut out = Vec::new();
            let mut path = Vec::with_capacity(self.dimensions.len());
            self.walk(&self.root, &mut path, &mut out);
            out
        }

        fn walk(
            &self,
            node: &GroupNode<'a>,
            path: &mut KeyPath,
            out: &mut Vec<(KeyPath, Vec<&'a Task>)>,
        ) {
            if path.len() == self.dimensions.len() {
                out.push((path.clone(), node.tasks.clone()));
                return;
            }
            for (key, child) in &node.children {
                path.push(key.clone());
                self.walk(child, path, out);
                path.pop();
            }
        }
    }

    /* ----------------------------- Flattened view ----------------------------- */

    /// A heading to print before a group; `nesting_level` 0 is the outermost dimension.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct GroupHeading {
        pub nesting_level: usize,
        pub name: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TaskGroup<'a> {
        /// One key per dimension.
        pub path: KeyPath,
        /// Only the headings that changed since the previous group.
        pub headings: Vec<GroupHeading>,
        pub tasks: Vec<&'a Task>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TaskGroups<'a> {
        dimensions: Vec<GroupingProperty>,
        groups: Vec<TaskGroup<'a>>,
    }

    impl<'a> TaskGroups<'a> {
        pub fn by(dimensions: &[GroupingProperty], tasks: &'a [Task]) -> Self {
            Self::by_with(dimensions, tasks, &GroupingOptions::default())
        }

        pub fn by_with(
            dimensions: &[GroupingProperty],
            tasks: &'a [Task],
            options: &GroupingOptions,
        ) -> Self {
            Self::from_tree(&GroupTree::from_tasks(dimensions, tasks, options))
        }

        pub fn from_tree(tree: &GroupTree<'a>) -> Self {
            let mut groups: Vec<TaskGroup<'a>> = Vec::new();
            for (path, tasks) in tree.render() {
                let unchanged = groups.last().map_or(0, |previous| {
                    previous
                        .path
                        .iter()
                        .zip(&path)
                        .take_while(|(a, b)| a == b)
                        .count()
                });
                let headings = path[unchanged..]
                    .iter()
                    .enumerate()
                    .map(|(offset, name)| GroupHeading {
                        nesting_level: unchanged + offset,
                        name: name.clone(),
                    })
                    .collect();
                groups.push(TaskGroup {
                    path,
                    headings,
                    tasks,
                });
            }
            debug!(groups = groups.len(), "flattened group tree");
            Self {
                dimensions: tree.dimensions().to_vec(),
                groups,
            }
        }

        pub fn dimensions(&self) -> &[GroupingProperty] {
            &self.dimensions
        }

        pub fn groups(&self) -> &[TaskGroup<'a>] {
            &self.groups
        }

        pub fn len(&self) -> usize {
            self.groups.len()
        }

        pub fn is_empty(&self) -> bool {
            self.groups.is_empty()
        }

        /// Task placements across all groups; a fanned-out task counts once per group.
        pub fn total_tasks_count(&self) -> usize {
            self.groups.iter().map(|g| g.tasks.len()).sum()
        }
    }

    /// Group `tasks` by `dimensions`, outermost first.
    pub fn by<'a>(dimensions: &[GroupingProperty], tasks: &'a [Task]) -> TaskGroups<'a> {
        TaskGroups::by(dimensions, tasks)
    }

}

pub mod format {
    //! Plain Markdown rendering of grouped tasks.

    use crate::core::Task;
    use crate::tree::TaskGroups;

    const FIRST_HEADING_LEVEL: usize = 4;
    const MAX_HEADING_LEVEL: usize = 6;

    pub fn format_task_groups(groups: &TaskGroups<'_>) -> String {
        let mut out = String::new();
        for (idx, group) in groups.groups().iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            for heading in &group.headings {
                let level = (FIRST_HEADING_LEVEL + heading.nesting_level).min(MAX_HEADING_LEVEL);
                out.push_str(&"#".repeat(level));
                out.push(' ');
                out.push_str(&heading.name);
                out.push_str("\n\n");
            }
            for task in &group.tasks {
                out.push_str(&format_task_line(task));
                out.push('\n');
            }
        }
        out
    }

    /// `- [{indicator}] {description}`; tags are already part of the description text.
    pub fn format_task_line(task: &Task) -> String {
        format!("- [{}] {}", task.status.indicator, task.description)
    }

}

pub mod storage {
    //! Loading task snapshots produced by an upstream extractor.

    use crate::core::Task;
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    #[derive(Debug, thiserror::Error)]
    pub enum StorageError {
        #[error("reading {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("decoding task list: {0}")]
        Json(#[from] serde_json::Error),
    }

    /// Source of task snapshots, kept separate from grouping.
    pub trait TaskSource {
        fn load(&self, path: &Path) -> Result<Vec<Task>, StorageError>;
    }

    /// Reads a JSON array of task objects.
    pub struct JsonTaskSource;

    impl TaskSource for JsonTaskSource {
        fn load(&self, path: &Path) -> Result<Vec<Task>, StorageError> {
            let text = fs::read_to_string(path).map_err(|source| StorageError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let tasks = parse_tasks_from_str(&text)?;
            debug!(?path, tasks = tasks.len(), "loaded tasks");
            Ok(tasks)
        }
    }

    pub fn parse_tasks_from_str(input: &str) -> Result<Vec<Task>, StorageError> {
        Ok(serde_json::from_str(input)?)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::Recurrence;

        #[test]
        fn loads_task_array_from_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let file = tmp.path().join("tasks.json");
            fs::write(
                &file,
                r##"[
                    {"description": "a", "path": "x/a.md", "tags": ["#one"]},
                    {"description": "b", "status": {"indicator": "x", "name": "Done"},
                     "recurrence": "every day"}
                ]"##,
            )
            .expect("write tasks");

            let tasks = JsonTaskSource.load(&file).expect("load tasks");
            assert_eq!(tasks.len(), 2);
            assert_eq!(tasks[0].filename(), Some("a"));
            assert_eq!(tasks[0].tags, vec!["#one".to_string()]);
            assert_eq!(tasks[1].recurrence, Some(Recurrence::new("every day")));
        }

        #[test]
        fn missing_file_reports_path() {
            let err = JsonTaskSource
                .load(Path::new("/definitely/not/here.json"))
                .expect_err("missing file");
            assert!(matches!(err, StorageError::Io { .. }));
            assert!(err.to_string().contains("here.json"));
        }

        #[test]
        fn malformed_json_is_an_error() {
            assert!(matches!(
                parse_tasks_from_str("{not json"),
                Err(StorageError::Json(_))
            ));
        }
    }
}

pub use group::{GroupingProperty, names_for_task};
pub use paths::paths_for_task;
pub use tree::{GroupTree, TaskGroups, by};
