//! Group-by tree over datapoint groups
//!
//! Each level of the tree partitions the groups of its parent by the value
//! one [`Grouper`] extracts. Children are ordered by value, so the rendered
//! table is deterministic.

use super::aggregates::aggregate;
use crate::{AggregateFunction, DatapointGroup, Timestamp};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Splits a datapoint group by one dimension
pub trait Grouper: Send + Sync {
    /// Column name of the dimension
    fn key(&self) -> String;

    /// Partition `group`, keyed by dimension value
    fn split(&self, group: &DatapointGroup) -> Vec<(String, DatapointGroup)>;
}

/// Groups by a metadata field; groups lacking the field land under ""
#[derive(Debug, Clone)]
pub struct FieldGrouper {
    field: String,
}

impl FieldGrouper {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Grouper for FieldGrouper {
    fn key(&self) -> String {
        self.field.clone()
    }

    fn split(&self, group: &DatapointGroup) -> Vec<(String, DatapointGroup)> {
        let value = group.metadata.get(&self.field).cloned().unwrap_or_default();
        vec![(value, group.clone())]
    }
}

/// Splits each group's points into fixed, epoch-aligned windows
#[derive(Debug, Clone)]
pub struct TimeGrouper {
    window: Duration,
}

impl TimeGrouper {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    fn window_nanos(&self) -> i64 {
        i64::try_from(self.window.as_nanos()).unwrap_or(i64::MAX).max(1)
    }
}

impl Grouper for TimeGrouper {
    fn key(&self) -> String {
        format!("_time_{}s", self.window.as_secs())
    }

    fn split(&self, group: &DatapointGroup) -> Vec<(String, DatapointGroup)> {
        let window = self.window_nanos();
        let mut windows: BTreeMap<Timestamp, DatapointGroup> = BTreeMap::new();
        for point in &group.points {
            let start = point.timestamp - point.timestamp.rem_euclid(window);
            windows
                .entry(start)
                .or_insert_with(|| DatapointGroup::new(group.metadata.clone(), group.metadata_hash))
                .points
                .push(*point);
        }
        windows
            .into_iter()
            .map(|(start, group)| (render_time(start), group))
            .collect()
    }
}

/// RFC 3339 rendering used for time columns
pub fn render_time(nanos: Timestamp) -> String {
    Utc.timestamp_nanos(nanos)
        .to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// One node of the group-by tree
#[derive(Debug, Clone)]
pub struct GroupTree {
    field: String,
    value: String,
    children: Vec<GroupTree>,
    /// Set on leaves only
    groups: Vec<DatapointGroup>,
}

/// Flattened group-by result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupedTable {
    pub columns: Vec<String>,
    pub rows: Vec<GroupedRow>,
}

/// One leaf of the tree rendered as a row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupedRow {
    /// Values matching the table's columns
    pub fields: Vec<String>,
    /// Aggregate over every point of the leaf
    pub value: Option<f64>,
    /// Number of points aggregated
    pub points: usize,
}

impl GroupTree {
    /// Build the tree; with no groupers the root is a single leaf
    pub fn build(groups: Vec<DatapointGroup>, groupers: &[Box<dyn Grouper>]) -> Self {
        let mut root = Self {
            field: String::new(),
            value: String::new(),
            children: Vec::new(),
            groups: Vec::new(),
        };
        root.partition(groups, groupers);
        root
    }

    fn partition(&mut self, groups: Vec<DatapointGroup>, groupers: &[Box<dyn Grouper>]) {
        let Some((grouper, rest)) = groupers.split_first() else {
            self.groups = groups;
            return;
        };

        let field = grouper.key();
        let mut by_value: BTreeMap<String, Vec<DatapointGroup>> = BTreeMap::new();
        for group in &groups {
            for (value, split) in grouper.split(group) {
                by_value.entry(value).or_default().push(split);
            }
        }

        self.children = by_value
            .into_iter()
            .map(|(value, groups)| {
                let mut child = Self {
                    field: field.clone(),
                    value,
                    children: Vec::new(),
                    groups: Vec::new(),
                };
                child.partition(groups, rest);
                child
            })
            .collect();
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn children(&self) -> &[GroupTree] {
        &self.children
    }

    /// Every datapoint group below this node
    pub fn groups(&self) -> Vec<&DatapointGroup> {
        if self.children.is_empty() {
            return self.groups.iter().collect();
        }
        self.children.iter().flat_map(|c| c.groups()).collect()
    }

    /// Render one row per leaf
    ///
    /// Columns are the group-by fields in tree order, then the requested
    /// `render_keys` that are not group-by fields (taken from the most
    /// specific group's metadata). With no `render_keys` only the group-by
    /// fields are shown.
    pub fn build_result_set(
        &self,
        render_keys: &[String],
        function: AggregateFunction,
    ) -> GroupedTable {
        let mut paths = Vec::new();
        self.collect_paths(&mut Vec::new(), &mut paths);

        let group_keys: Vec<String> = match paths.first() {
            Some((path, _)) => path.iter().map(|(field, _)| field.clone()).collect(),
            None => Vec::new(),
        };
        let extra_keys: Vec<&String> = render_keys
            .iter()
            .filter(|k| !group_keys.contains(k))
            .collect();

        let mut columns = group_keys.clone();
        columns.extend(extra_keys.iter().map(|k| k.to_string()));

        let rows = paths
            .into_iter()
            .map(|(path, leaf)| {
                let mut fields: Vec<String> = path.into_iter().map(|(_, value)| value).collect();
                let specific = leaf.groups.first();
                for key in &extra_keys {
                    fields.push(
                        specific
                            .and_then(|g| g.metadata.get(*key))
                            .cloned()
                            .unwrap_or_default(),
                    );
                }
                let points = leaf.groups.iter().flat_map(|g| g.points.iter());
                GroupedRow {
                    fields,
                    value: aggregate(function, points),
                    points: leaf.groups.iter().map(|g| g.points.len()).sum(),
                }
            })
            .collect();

        GroupedTable { columns, rows }
    }

    fn collect_paths<'a>(
        &'a self,
        path: &mut Vec<(String, String)>,
        out: &mut Vec<(Vec<(String, String)>, &'a GroupTree)>,
    ) {
        let pushed = !self.field.is_empty();
        if pushed {
            path.push((self.field.clone(), self.value.clone()));
        }
        if self.children.is_empty() {
            if !self.groups.is_empty() {
                out.push((path.clone(), self));
            }
        } else {
            for child in &self.children {
                child.collect_paths(path, out);
            }
        }
        if pushed {
            path.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Metadata, RawPoint, NANOS_PER_SEC};

    fn group(tags: &[(&str, &str)], hash: u32, points: &[(i64, f64)]) -> DatapointGroup {
        let metadata: Metadata = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut g = DatapointGroup::new(metadata, hash);
        g.points = points
            .iter()
            .map(|&(t, v)| RawPoint::new(t * NANOS_PER_SEC, v))
            .collect();
        g
    }

    fn fixture() -> Vec<DatapointGroup> {
        vec![
            group(&[("host", "h2"), ("dc", "ams"), ("os", "linux")], 1, &[(0, 1.0), (70, 2.0)]),
            group(&[("host", "h1"), ("dc", "ams"), ("os", "bsd")], 2, &[(10, 3.0)]),
            group(&[("host", "h3"), ("dc", "fra"), ("os", "linux")], 3, &[(20, 4.0)]),
            group(&[("dc", "fra")], 4, &[(30, 5.0)]),
        ]
    }

    fn field(name: &str) -> Box<dyn Grouper> {
        Box::new(FieldGrouper::new(name))
    }

    #[test]
    fn test_no_groupers_single_row() {
        let tree = GroupTree::build(fixture(), &[]);
        let table = tree.build_result_set(&[], AggregateFunction::Sum);
        assert!(table.columns.is_empty());
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].value, Some(15.0));
        assert_eq!(table.rows[0].points, 5);
    }

    #[test]
    fn test_two_level_tree_is_sorted() {
        let tree = GroupTree::build(fixture(), &[field("dc"), field("host")]);
        let values: Vec<_> = tree.children().iter().map(|c| c.value()).collect();
        assert_eq!(values, vec!["ams", "fra"]);

        let table = tree.build_result_set(&[], AggregateFunction::Sum);
        assert_eq!(table.columns, vec!["dc", "host"]);
        let rows: Vec<_> = table
            .rows
            .iter()
            .map(|r| (r.fields.join("/"), r.value))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("ams/h1".to_string(), Some(3.0)),
                ("ams/h2".to_string(), Some(3.0)),
                ("fra/".to_string(), Some(5.0)),
                ("fra/h3".to_string(), Some(4.0)),
            ]
        );
    }

    #[test]
    fn test_render_keys_from_most_specific_group() {
        let tree = GroupTree::build(fixture(), &[field("host")]);
        let render = vec!["os".to_string(), "host".to_string()];
        let table = tree.build_result_set(&render, AggregateFunction::Count);
        assert_eq!(table.columns, vec!["host", "os"]);
        let h1 = table.rows.iter().find(|r| r.fields[0] == "h1").unwrap();
        assert_eq!(h1.fields, vec!["h1", "bsd"]);
        let anonymous = table.rows.iter().find(|r| r.fields[0].is_empty()).unwrap();
        assert_eq!(anonymous.fields, vec!["", ""]);
    }

    #[test]
    fn test_time_grouper_splits_points() {
        let tree = GroupTree::build(
            fixture(),
            &[Box::new(TimeGrouper::new(Duration::from_secs(60))), field("dc")],
        );
        let table = tree.build_result_set(&[], AggregateFunction::Sum);
        assert_eq!(table.columns, vec!["_time_60s", "dc"]);
        let rows: Vec<_> = table
            .rows
            .iter()
            .map(|r| (r.fields.clone(), r.value))
            .collect();
        assert_eq!(
            rows,
            vec![
                (vec!["1970-01-01T00:00:00Z".to_string(), "ams".to_string()], Some(4.0)),
                (vec!["1970-01-01T00:00:00Z".to_string(), "fra".to_string()], Some(9.0)),
                (vec!["1970-01-01T00:01:00Z".to_string(), "ams".to_string()], Some(2.0)),
            ]
        );
    }

    #[test]
    fn test_time_grouper_window_wider_than_timestamps() {
        let tree = GroupTree::build(
            fixture(),
            &[Box::new(TimeGrouper::new(Duration::from_secs(u64::MAX)))],
        );
        let table = tree.build_result_set(&[], AggregateFunction::Sum);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].value, Some(15.0));
    }

    #[test]
    fn test_empty_input_renders_no_rows() {
        let tree = GroupTree::build(Vec::new(), &[field("host")]);
        let table = tree.build_result_set(&[], AggregateFunction::Sum);
        assert!(table.rows.is_empty());
        assert!(tree.groups().is_empty());
    }
}
