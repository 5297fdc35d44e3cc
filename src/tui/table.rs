use std::collections::HashMap;

use unicode_width::UnicodeWidthStr;

use crate::models::{PipelineKey, MAX_STEP_DEPTH};

use super::text::{Alignment, Class, StyledString};

/// Identifier of a node among its siblings: the pipeline key for
/// top-level rows, a step id below.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeId {
    Key(PipelineKey),
    Id(String),
}

/// Root-to-node identifier sequence. Paths are small (bounded depth) and
/// compared by value, which is what lets fold and cursor state survive
/// rebuilds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NodePath(Vec<NodeId>);

impl NodePath {
    fn child(&self, id: NodeId) -> NodePath {
        assert!(
            self.0.len() < MAX_STEP_DEPTH,
            "node path length cannot exceed {MAX_STEP_DEPTH}"
        );
        let mut ids = self.0.clone();
        ids.push(id);
        NodePath(ids)
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnId {
    Pipeline,
    State,
    Type,
    Ref,
    Started,
    Finished,
    Duration,
}

pub struct Column {
    pub header: &'static str,
    pub max_width: usize,
    pub alignment: Alignment,
    /// Tree-drawing glyphs are prepended to this column's values.
    pub tree_prefix: bool,
}

/// Ordered column set; the order is the display order.
pub struct TableConfig {
    columns: Vec<(ColumnId, Column)>,
}

impl TableConfig {
    pub fn new(columns: Vec<(ColumnId, Column)>) -> Self {
        Self { columns }
    }

    fn ids(&self) -> impl Iterator<Item = ColumnId> + '_ {
        self.columns.iter().map(|(id, _)| *id)
    }

    fn column(&self, id: ColumnId) -> &Column {
        &self
            .columns
            .iter()
            .find(|(i, _)| *i == id)
            .expect("column id in configuration")
            .1
    }
}

/// A displayable tree node. Implementations provide identity, children
/// and per-column values; the table owns fold state and layout.
pub trait TableNode {
    fn node_id(&self) -> NodeId;
    fn node_children(&self) -> Vec<&dyn TableNode>;
    fn values(&self) -> HashMap<ColumnId, StyledString>;
    /// Columns whose value, when absent on this node, is copied from the
    /// parent (e.g. ref and provider shown on every job row).
    fn inherited_columns(&self) -> &[ColumnId];
}

#[derive(Debug, Clone)]
struct InnerNode {
    path: NodePath,
    prefix: String,
    traversable: bool,
    values: HashMap<ColumnId, StyledString>,
    children: Vec<InnerNode>,
}

impl InnerNode {
    fn build(
        node: &dyn TableNode,
        parent_path: &NodePath,
        parent_values: &HashMap<ColumnId, StyledString>,
        traversable: &HashMap<NodePath, bool>,
    ) -> InnerNode {
        let path = parent_path.child(node.node_id());
        let mut values = node.values();
        for column in node.inherited_columns() {
            if !values.contains_key(column) {
                if let Some(value) = parent_values.get(column) {
                    values.insert(*column, value.clone());
                }
            }
        }

        let children = node
            .node_children()
            .into_iter()
            .map(|child| InnerNode::build(child, &path, &values, traversable))
            .collect();

        InnerNode {
            traversable: traversable.get(&path).copied().unwrap_or(false),
            path,
            prefix: String::new(),
            values,
            children,
        }
    }

    /// Tree-drawing glyphs, recomputed on every traversal change.
    fn set_prefix(&mut self, parent: &str, is_last_child: bool) {
        if parent.is_empty() {
            self.prefix = if self.children.is_empty() {
                "  ".to_string()
            } else if self.traversable {
                "- ".to_string()
            } else {
                "+ ".to_string()
            };
            let count = self.children.len();
            for (i, child) in self.children.iter_mut().enumerate() {
                child.set_prefix(" ", i == count - 1);
            }
        } else {
            let connector = if is_last_child { "└─" } else { "├─" };
            let marker = if self.children.is_empty() || self.traversable {
                "─ "
            } else {
                "+ "
            };
            self.prefix = format!("{parent}{connector}{marker}");

            let continuation = if is_last_child {
                format!("{parent}    ")
            } else {
                format!("{parent}│   ")
            };
            let count = self.children.len();
            for (i, child) in self.children.iter_mut().enumerate() {
                child.set_prefix(&continuation, i == count - 1);
            }
        }
    }

    fn depth_first<'a>(&'a self, traverse_all: bool, explored: &mut Vec<&'a InnerNode>) {
        explored.push(self);
        if traverse_all || self.traversable {
            for child in &self.children {
                child.depth_first(traverse_all, explored);
            }
        }
    }

    fn for_each(&mut self, f: &mut dyn FnMut(&mut InnerNode)) {
        f(self);
        for child in &mut self.children {
            child.for_each(f);
        }
    }
}

/// Foldable table over a forest of nodes with stable identity paths.
///
/// Fold state, cursor and page survive `replace` because they are keyed
/// by node path, not row index.
pub struct HierarchicalTable {
    conf: TableConfig,
    nodes: Vec<InnerNode>,
    /// Fold-aware depth-first traversal of `nodes`.
    rows: Vec<NodePath>,
    /// Index in `rows` of the first node of the current page.
    page_index: Option<usize>,
    /// Index in `rows` of the cursor.
    cursor_index: Option<usize>,
    width: usize,
    height: usize,
    sep: &'static str,
    /// Column widths only grow between rebuilds, to avoid flicker.
    column_width: HashMap<ColumnId, usize>,
    horizontal_offset: usize,
    sort_column: usize,
    sort_ascending: bool,
}

impl HierarchicalTable {
    pub fn new(conf: TableConfig, width: usize, height: usize) -> Self {
        let mut column_width = HashMap::new();
        for (id, column) in &conf.columns {
            column_width.insert(*id, UnicodeWidthStr::width(column.header));
        }

        Self {
            conf,
            nodes: Vec::new(),
            rows: Vec::new(),
            page_index: None,
            cursor_index: None,
            width,
            height,
            sep: "  ",
            column_width,
            horizontal_offset: 0,
            sort_column: 0,
            sort_ascending: true,
        }
    }

    /// Number of node rows visible on screen (one line goes to the header).
    pub fn page_size(&self) -> usize {
        self.height.saturating_sub(1)
    }

    /// Rebuilds the forest, preserving fold state, cursor and page by path.
    pub fn replace(&mut self, nodes: &[&dyn TableNode]) {
        let mut traversable = HashMap::new();
        let mut all = Vec::new();
        for node in &self.nodes {
            node.depth_first(true, &mut all);
        }
        for node in all {
            traversable.insert(node.path.clone(), node.traversable);
        }

        let empty_path = NodePath::default();
        let empty_values = HashMap::new();
        self.nodes = nodes
            .iter()
            .map(|n| InnerNode::build(*n, &empty_path, &empty_values, &traversable))
            .collect();

        self.sort_nodes();
        self.compute_traversal();
    }

    /// Sorts the top-level rows by the selected column's plain text, with
    /// the node path as tie-break for deterministic display.
    fn sort_nodes(&mut self) {
        let Some((column, _)) = self.conf.columns.get(self.sort_column) else {
            return;
        };
        let column = *column;
        let ascending = self.sort_ascending;
        self.nodes.sort_by(|a, b| {
            let ka = a.values.get(&column).map(StyledString::plain).unwrap_or_default();
            let kb = b.values.get(&column).map(StyledString::plain).unwrap_or_default();
            let ordering = ka.cmp(&kb).then_with(|| compare_paths(&a.path, &b.path));
            if ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
    }

    fn compute_traversal(&mut self) {
        let page_path = self.page_index.map(|i| self.rows[i].clone());
        let cursor_path = self.cursor_index.map(|i| self.rows[i].clone());

        for node in &mut self.nodes {
            node.set_prefix("", false);
        }

        self.page_index = None;
        self.cursor_index = None;

        let mut flattened = Vec::new();
        for node in &self.nodes {
            node.depth_first(false, &mut flattened);
        }

        for (i, node) in flattened.iter().enumerate() {
            if Some(&node.path) == page_path.as_ref() {
                self.page_index = Some(i);
            }
            if Some(&node.path) == cursor_path.as_ref() {
                self.cursor_index = Some(i);
            }
        }
        if !flattened.is_empty() {
            self.page_index.get_or_insert(0);
            self.cursor_index.get_or_insert(0);
        }

        for node in &flattened {
            for id in self.conf.ids() {
                let mut w = node.values.get(&id).map_or(0, StyledString::length);
                if self.conf.column(id).tree_prefix {
                    w += UnicodeWidthStr::width(node.prefix.as_str());
                }
                let entry = self.column_width.entry(id).or_default();
                *entry = (*entry).max(w);
            }
        }

        self.rows = flattened.into_iter().map(|n| n.path.clone()).collect();
    }

    fn node_at(&self, path: &NodePath) -> Option<&InnerNode> {
        let mut candidates = self.nodes.iter();
        let mut depth = 0;
        loop {
            let node = candidates.find(|n| n.path.0.get(depth) == path.0.get(depth))?;
            if node.path == *path {
                return Some(node);
            }
            candidates = node.children.iter();
            depth += 1;
        }
    }

    fn node_at_mut(&mut self, path: &NodePath) -> Option<&mut InnerNode> {
        let mut candidates = self.nodes.iter_mut();
        let mut depth = 0;
        loop {
            let node = candidates.find(|n| n.path.0.get(depth) == path.0.get(depth))?;
            if node.path == *path {
                return Some(node);
            }
            candidates = node.children.iter_mut();
            depth += 1;
        }
    }

    /// Opens or closes the fold at the cursor, optionally for the whole
    /// subtree.
    pub fn set_traversable(&mut self, traversable: bool, recursive: bool) {
        let Some(cursor) = self.cursor_index else {
            return;
        };
        let path = self.rows[cursor].clone();
        if let Some(node) = self.node_at_mut(&path) {
            if recursive {
                node.for_each(&mut |n| n.traversable = traversable);
            } else {
                node.traversable = traversable;
            }
        }
        self.compute_traversal();
    }

    /// Moves the cursor by `amount` rows in the flattened traversal,
    /// keeping it on-page.
    pub fn scroll(&mut self, amount: isize) {
        let (Some(mut cursor), Some(mut page)) = (self.cursor_index, self.page_index) else {
            return;
        };
        let last = self.rows.len() as isize - 1;
        cursor = crate::utils::bounded(cursor as isize + amount, 0, last) as usize;

        if cursor < page {
            page = cursor;
        } else if self.page_size() > 0 && cursor > page + self.page_size() - 1 {
            let overshoot = cursor - (page + self.page_size() - 1);
            page = crate::utils::bounded((page + overshoot) as isize, 0, last) as usize;
            cursor = page + self.page_size() - 1;
        }

        self.cursor_index = Some(cursor);
        self.page_index = Some(page);
    }

    pub fn top(&mut self) {
        self.scroll(-(self.rows.len() as isize));
    }

    pub fn bottom(&mut self) {
        self.scroll(self.rows.len() as isize);
    }

    pub fn scroll_horizontal(&mut self, amount: isize) {
        self.horizontal_offset = self.horizontal_offset.saturating_add_signed(amount);
    }

    /// Moves the sort column left or right and re-sorts.
    pub fn move_sort_column(&mut self, amount: isize) {
        let last = self.conf.columns.len() as isize - 1;
        self.sort_column = crate::utils::bounded(self.sort_column as isize + amount, 0, last) as usize;
        self.sort_nodes();
        self.compute_traversal();
    }

    pub fn reverse_sort(&mut self) {
        self.sort_ascending = !self.sort_ascending;
        self.sort_nodes();
        self.compute_traversal();
    }

    /// Circular search from the row after the cursor for a row whose any
    /// column contains `needle` (exact substring, no case folding).
    /// Returns whether the cursor moved to a match.
    pub fn scroll_to_match(&mut self, needle: &str, ascending: bool) -> bool {
        let Some(cursor) = self.cursor_index else {
            return false;
        };
        if self.rows.is_empty() {
            return false;
        }

        let len = self.rows.len() as isize;
        let step: isize = if ascending { 1 } else { -1 };
        let mut i = crate::utils::modulo(cursor as isize + step, len);
        while i != cursor as isize {
            let row = &self.rows[i as usize];
            let matched = self.node_at(row).is_some_and(|node| {
                self.conf
                    .ids()
                    .any(|id| node.values.get(&id).is_some_and(|v| v.contains(needle)))
            });
            if matched {
                self.scroll(i - cursor as isize);
                return true;
            }
            i = crate::utils::modulo(i + step, len);
        }

        false
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;

        if self.page_size() > 0 {
            if let (Some(cursor), Some(page)) = (self.cursor_index, self.page_index) {
                let last = self.rows.len().saturating_sub(1);
                let upper = (page + self.page_size() - 1).min(last);
                self.cursor_index = Some(cursor.clamp(page, upper.max(page)));
            } else if !self.rows.is_empty() {
                self.page_index = Some(0);
                self.cursor_index = Some(0);
            }
        } else {
            self.page_index = None;
            self.cursor_index = None;
        }
    }

    /// Path of the cursor node, root pipeline first.
    pub fn active_node_path(&self) -> Option<NodePath> {
        self.cursor_index.map(|i| self.rows[i].clone())
    }

    fn styled_row(&self, values: &HashMap<ColumnId, StyledString>, prefix: &str) -> StyledString {
        let mut padded = Vec::new();
        for (id, column) in &self.conf.columns {
            let mut value = values.get(id).cloned().unwrap_or_default();
            if column.tree_prefix {
                let mut prefixed = StyledString::new(prefix);
                prefixed.append_string(value);
                value = prefixed;
            }
            let width = self
                .column_width
                .get(id)
                .copied()
                .unwrap_or(0)
                .min(column.max_width);
            value.fit(column.alignment, width);
            padded.push(value);
        }
        let mut line = StyledString::join(padded, StyledString::new(self.sep));
        line.crop_left(self.horizontal_offset);
        line.fit(Alignment::Left, self.width);
        line
    }

    fn header(&self) -> StyledString {
        let mut values = HashMap::new();
        for (id, column) in &self.conf.columns {
            values.insert(*id, StyledString::new(column.header));
        }
        let mut line = self.styled_row(&values, "");
        line.add_class(Class::TableHeader);
        line
    }

    /// One line per visible row, header first, cursor row highlighted.
    pub fn lines(&self) -> Vec<StyledString> {
        let mut lines = Vec::new();
        if self.height == 0 {
            return lines;
        }
        lines.push(self.header());

        if let (Some(page), Some(cursor)) = (self.page_index, self.cursor_index) {
            for (i, path) in self
                .rows
                .iter()
                .enumerate()
                .skip(page)
                .take(self.page_size())
            {
                let Some(node) = self.node_at(path) else {
                    continue;
                };
                let mut line = self.styled_row(&node.values, &node.prefix);
                if i == cursor {
                    line.add_class(Class::ActiveRow);
                }
                lines.push(line);
            }
        }

        lines
    }
}

fn compare_paths(a: &NodePath, b: &NodePath) -> std::cmp::Ordering {
    fn key(id: &NodeId) -> (u8, String) {
        match id {
            NodeId::Key(k) => (0, format!("{}/{}", k.provider_id, k.id)),
            NodeId::Id(s) => (1, s.clone()),
        }
    }
    let ka: Vec<_> = a.0.iter().map(key).collect();
    let kb: Vec<_> = b.0.iter().map(key).collect();
    ka.cmp(&kb)
}
