//! Fair task assignment
//!
//! Splits a flat list of work units into `ceil(channels / channels_per_group)`
//! groups. Units that share a resource mark are spread across groups so a
//! contended table or shard is hit by as few tasks per group as possible.

use crate::error::{Result, SyncError};
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use tracing::debug;

/// Smallest schedulable piece of work: one reader/writer task pair
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit<T> {
    pub task_id: usize,
    /// Contended resource on the reader side
    pub reader_mark: Option<String>,
    /// Contended resource on the writer side
    pub writer_mark: Option<String>,
    /// Connector-specific description of the work
    pub payload: T,
}

impl<T> WorkUnit<T> {
    pub fn new(task_id: usize, payload: T) -> Self {
        Self {
            task_id,
            reader_mark: None,
            writer_mark: None,
            payload,
        }
    }

    pub fn with_reader_mark(mut self, mark: impl Into<String>) -> Self {
        self.reader_mark = Some(mark.into());
        self
    }

    pub fn with_writer_mark(mut self, mark: impl Into<String>) -> Self {
        self.writer_mark = Some(mark.into());
        self
    }

    fn mark(&self, side: MarkSide) -> Option<&str> {
        match side {
            MarkSide::Reader => self.reader_mark.as_deref(),
            MarkSide::Writer => self.writer_mark.as_deref(),
        }
    }
}

/// Units and channel budget of one task group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig<T> {
    pub group_id: usize,
    pub channels: usize,
    pub units: Vec<WorkUnit<T>>,
}

impl<T> GroupConfig<T> {
    pub fn task_ids(&self) -> Vec<usize> {
        self.units.iter().map(|u| u.task_id).collect()
    }
}

/// Side whose marks drive the spreading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkSide {
    Reader,
    Writer,
}

/// Pick the side declaring more distinct marks; the reader side wins ties.
/// `None` when no unit declares any mark.
pub fn fairness_side<T>(units: &[WorkUnit<T>]) -> Option<MarkSide> {
    let distinct = |side: MarkSide| {
        units
            .iter()
            .filter_map(|u| u.mark(side))
            .collect::<HashSet<_>>()
            .len()
    };
    let readers = distinct(MarkSide::Reader);
    let writers = distinct(MarkSide::Writer);

    if readers == 0 && writers == 0 {
        None
    } else if readers >= writers {
        Some(MarkSide::Reader)
    } else {
        Some(MarkSide::Writer)
    }
}

/// Number of groups for a channel budget
pub fn group_count(channels: usize, channels_per_group: usize) -> usize {
    channels.div_ceil(channels_per_group)
}

/// Distribute `units` over `ceil(channels / channels_per_group)` groups.
///
/// Each mark's units are dealt to consecutive groups off one shared counter,
/// which keeps group sizes within one of each other and never doubles a mark
/// up in a group while another group lacks it, unless the mark has more units
/// than there are groups. Group channel budgets differ by at most one.
pub fn assign_fairly<T>(
    mut units: Vec<WorkUnit<T>>,
    channels: usize,
    channels_per_group: usize,
) -> Result<Vec<GroupConfig<T>>> {
    if units.is_empty() {
        return Err(SyncError::config("no work units to assign"));
    }
    if channels == 0 || channels_per_group == 0 {
        return Err(SyncError::config(format!(
            "channels ({}) and channels_per_group ({}) must be positive",
            channels, channels_per_group
        )));
    }
    let mut seen = HashSet::with_capacity(units.len());
    if let Some(dup) = units.iter().find(|u| !seen.insert(u.task_id)) {
        return Err(SyncError::config(format!(
            "duplicate task id {} in work units",
            dup.task_id
        )));
    }

    let groups = group_count(channels, channels_per_group);
    let side = fairness_side(&units);
    if side.is_none() {
        units.shuffle(&mut rand::thread_rng());
    }
    let side = side.unwrap_or(MarkSide::Reader);

    // mark -> positions in `units`; unmarked units share the `None` key
    let mut by_mark: IndexMap<Option<String>, Vec<usize>> = IndexMap::new();
    for (pos, unit) in units.iter().enumerate() {
        by_mark
            .entry(unit.mark(side).map(str::to_string))
            .or_default()
            .push(pos);
    }

    // (round within mark, position) per group
    let mut slots: Vec<Vec<(usize, usize)>> = vec![Vec::new(); groups];
    let mut counter = 0usize;
    for positions in by_mark.values() {
        for (round, &pos) in positions.iter().enumerate() {
            slots[counter % groups].push((round, pos));
            counter += 1;
        }
    }

    let mut pool: Vec<Option<WorkUnit<T>>> = units.into_iter().map(Some).collect();
    let avg = channels / groups;
    let remainder = channels % groups;

    let configs: Vec<GroupConfig<T>> = slots
        .into_iter()
        .enumerate()
        .map(|(group_id, mut slot)| {
            slot.sort_unstable();
            let units = slot
                .into_iter()
                .filter_map(|(_, pos)| pool[pos].take())
                .collect();
            GroupConfig {
                group_id,
                channels: if group_id < remainder { avg + 1 } else { avg },
                units,
            }
        })
        .collect();

    debug!(
        groups,
        marks = by_mark.len(),
        side = ?side,
        "Assigned work units: {:?}",
        configs.iter().map(|g| g.units.len()).collect::<Vec<_>>()
    );
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn units(marks: &[(Option<&str>, Option<&str>)]) -> Vec<WorkUnit<()>> {
        marks
            .iter()
            .enumerate()
            .map(|(id, (r, w))| {
                let mut unit = WorkUnit::new(id, ());
                unit.reader_mark = r.map(str::to_string);
                unit.writer_mark = w.map(str::to_string);
                unit
            })
            .collect()
    }

    #[test]
    fn test_rejects_invalid_input() {
        assert!(assign_fairly(Vec::<WorkUnit<()>>::new(), 4, 2).is_err());
        assert!(assign_fairly(units(&[(None, None)]), 0, 2).is_err());
        assert!(assign_fairly(units(&[(None, None)]), 4, 0).is_err());

        let dup = vec![WorkUnit::new(1, ()), WorkUnit::new(1, ())];
        let err = assign_fairly(dup, 2, 1).unwrap_err();
        assert!(err.to_string().contains("duplicate task id 1"));
    }

    #[test]
    fn test_same_mark_split_across_groups() {
        let input = units(&[(Some("A"), None), (Some("A"), None), (Some("B"), None)]);
        let groups = assign_fairly(input, 2, 1).unwrap();

        assert_eq!(groups.len(), 2);
        for group in &groups {
            let a_count = group
                .units
                .iter()
                .filter(|u| u.reader_mark.as_deref() == Some("A"))
                .count();
            assert_eq!(a_count, 1, "group {} holds {} A units", group.group_id, a_count);
        }
    }

    #[test]
    fn test_channel_budget_balanced() {
        let groups = assign_fairly(units(&[(None, None); 10]), 11, 3).unwrap();
        let channels: Vec<usize> = groups.iter().map(|g| g.channels).collect();
        assert_eq!(channels, vec![3, 3, 3, 2]);
        assert_eq!(groups.iter().map(|g| g.units.len()).sum::<usize>(), 10);
    }

    #[test]
    fn test_writer_side_used_when_it_has_more_marks() {
        let input = units(&[
            (Some("db"), Some("t1")),
            (Some("db"), Some("t2")),
            (Some("db"), Some("t1")),
            (Some("db"), Some("t2")),
        ]);
        assert_eq!(fairness_side(&input), Some(MarkSide::Writer));

        let groups = assign_fairly(input, 2, 1).unwrap();
        for group in &groups {
            let mut marks: Vec<_> = group
                .units
                .iter()
                .filter_map(|u| u.writer_mark.clone())
                .collect();
            marks.sort();
            assert_eq!(marks, vec!["t1".to_string(), "t2".to_string()]);
        }
    }

    #[test]
    fn test_reader_side_wins_ties() {
        let input = units(&[(Some("a"), Some("x")), (Some("b"), Some("y"))]);
        assert_eq!(fairness_side(&input), Some(MarkSide::Reader));
        assert_eq!(fairness_side(&units(&[(None, None)])), None);
    }

    #[test]
    fn test_group_tasks_interleave_marks() {
        let input = units(&[
            (Some("A"), None),
            (Some("A"), None),
            (Some("A"), None),
            (Some("A"), None),
            (Some("B"), None),
            (Some("B"), None),
        ]);
        let groups = assign_fairly(input, 2, 1).unwrap();

        // A0->g0 A1->g1 A2->g0 A3->g1 B4->g0 B5->g1, ordered by round
        assert_eq!(groups[0].task_ids(), vec![0, 4, 2]);
        assert_eq!(groups[1].task_ids(), vec![1, 5, 3]);
    }

    #[test]
    fn test_unmarked_units_all_assigned() {
        let groups = assign_fairly(units(&[(None, None); 7]), 6, 2).unwrap();
        assert_eq!(groups.len(), 3);

        let mut ids: Vec<usize> = groups.iter().flat_map(|g| g.task_ids()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());

        let sizes: Vec<usize> = groups.iter().map(|g| g.units.len()).collect();
        assert!(sizes.iter().all(|s| *s == 2 || *s == 3));
    }

    #[test]
    fn test_more_groups_than_units() {
        let groups = assign_fairly(units(&[(Some("A"), None)]), 3, 1).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].units.len(), 1);
        assert!(groups[1].units.is_empty());
        assert!(groups[2].units.is_empty());
    }
}
