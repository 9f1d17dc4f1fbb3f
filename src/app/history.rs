use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::app::models::Command;
use crate::app::observable::{Observable, Subscription};

struct HistoryInner {
    entries: VecDeque<Command>,
    next_index: u64,
    // False when appends happened with nobody watching.
    published: bool,
}

/// Ordered log of submitted commands.
///
/// Indices only ever grow, so two entries never share one even when their
/// text is identical. With a cap, the oldest entries are evicted first.
pub struct HistoryLog {
    inner: RwLock<HistoryInner>,
    cap: Option<usize>,
    texts: Observable<Vec<String>>,
}

impl HistoryLog {
    pub fn new(cap: Option<usize>) -> Self {
        Self {
            inner: RwLock::new(HistoryInner {
                entries: VecDeque::new(),
                next_index: 0,
                published: true,
            }),
            cap: cap.filter(|limit| *limit > 0),
            texts: Observable::new(Vec::new()),
        }
    }

    /// Restores previously saved texts in their original order.
    pub fn with_entries(cap: Option<usize>, texts: impl IntoIterator<Item = String>) -> Self {
        let log = Self::new(cap);
        {
            let mut inner = log.write();
            for text in texts {
                push_entry(&mut inner, log.cap, text);
            }
            log.texts.set(inner.entries.iter().map(|c| c.text.clone()).collect());
        }
        log
    }

    pub fn append(&self, text: impl Into<String>) -> Command {
        let mut inner = self.write();
        let command = push_entry(&mut inner, self.cap, text.into());
        if self.texts.observer_count() > 0 {
            self.texts
                .set(inner.entries.iter().map(|c| c.text.clone()).collect());
            inner.published = true;
        } else {
            inner.published = false;
        }
        command
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn cap(&self) -> Option<usize> {
        self.cap
    }

    /// Most recent first. The view is a stable copy and can be iterated any
    /// number of times.
    pub fn reversed_view(&self) -> HistoryView {
        let inner = self.read();
        HistoryView {
            entries: inner.entries.iter().cloned().collect(),
        }
    }

    /// Texts in insertion order.
    pub fn texts(&self) -> Vec<String> {
        self.read().entries.iter().map(|c| c.text.clone()).collect()
    }

    /// Lets a picker choose from the most-recent-first list. Nothing is removed.
    pub fn select<F>(&self, chooser: F) -> Option<Command>
    where
        F: FnOnce(&[Command]) -> Option<usize>,
    {
        let view = self.reversed_view();
        let items: Vec<Command> = view.iter().cloned().collect();
        if items.is_empty() {
            return None;
        }
        let picked = chooser(&items)?;
        items.into_iter().nth(picked)
    }

    /// Insertion-ordered texts, replayed on attach and republished on append.
    pub fn subscribe(&self) -> Subscription<Vec<String>> {
        // Held across refresh and attach so no append slips in between.
        let mut inner = self.write();
        if !inner.published {
            self.texts
                .set(inner.entries.iter().map(|c| c.text.clone()).collect());
            inner.published = true;
        }
        self.texts.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, HistoryInner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HistoryInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn push_entry(inner: &mut HistoryInner, cap: Option<usize>, text: String) -> Command {
    let command = Command {
        index: inner.next_index,
        text,
    };
    inner.next_index += 1;
    inner.entries.push_back(command.clone());
    if let Some(limit) = cap {
        while inner.entries.len() > limit {
            inner.entries.pop_front();
        }
    }
    command
}

#[derive(Debug, Clone)]
pub struct HistoryView {
    entries: Arc<[Command]>,
}

impl HistoryView {
    pub fn iter(&self) -> std::iter::Rev<std::slice::Iter<'_, Command>> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn texts(&self) -> Vec<String> {
        self.iter().map(|c| c.text.clone()).collect()
    }
}

impl<'a> IntoIterator for &'a HistoryView {
    type Item = &'a Command;
    type IntoIter = std::iter::Rev<std::slice::Iter<'a, Command>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_view_is_reverse_of_insertion() {
        let log = HistoryLog::new(None);
        for text in ["ls", "pwd", "id", "ls"] {
            log.append(text);
        }
        assert_eq!(log.reversed_view().texts(), vec!["ls", "id", "pwd", "ls"]);
        assert_eq!(log.texts(), vec!["ls", "pwd", "id", "ls"]);
    }

    #[test]
    fn view_is_restartable() {
        let log = HistoryLog::new(None);
        log.append("a");
        log.append("b");
        let view = log.reversed_view();
        let first: Vec<_> = view.iter().map(|c| c.text.as_str()).collect();
        let second: Vec<_> = (&view).into_iter().map(|c| c.text.as_str()).collect();
        assert_eq!(first, second);
        log.append("c");
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn indices_are_unique_even_for_duplicate_text() {
        let log = HistoryLog::new(None);
        let first = log.append("reboot");
        let second = log.append("reboot");
        assert_ne!(first.index, second.index);
        assert!(second.index > first.index);
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let log = HistoryLog::new(Some(2));
        log.append("one");
        log.append("two");
        log.append("three");
        assert_eq!(log.len(), 2);
        assert_eq!(log.reversed_view().texts(), vec!["three", "two"]);
    }

    #[test]
    fn zero_cap_means_unbounded() {
        let log = HistoryLog::new(Some(0));
        for i in 0..10 {
            log.append(format!("echo {i}"));
        }
        assert_eq!(log.len(), 10);
        assert_eq!(log.cap(), None);
    }

    #[test]
    fn select_does_not_remove() {
        let log = HistoryLog::new(None);
        log.append("ls");
        log.append("pwd");
        let picked = log.select(|items| {
            assert_eq!(items[0].text, "pwd");
            Some(1)
        });
        assert_eq!(picked.map(|c| c.text), Some("ls".to_string()));
        assert_eq!(log.len(), 2);
        assert!(log.select(|_| Some(9)).is_none());
    }

    #[test]
    fn select_on_empty_history_never_asks() {
        let log = HistoryLog::new(None);
        let picked = log.select(|_| panic!("chooser must not run"));
        assert!(picked.is_none());
    }

    #[test]
    fn subscribers_see_current_list_then_appends() {
        let log = HistoryLog::with_entries(Some(5), vec!["ls".to_string()]);
        let sub = log.subscribe();
        log.append("pwd");
        assert_eq!(sub.try_recv(), Some(vec!["ls".to_string()]));
        assert_eq!(sub.try_recv(), Some(vec!["ls".to_string(), "pwd".to_string()]));
    }
}
