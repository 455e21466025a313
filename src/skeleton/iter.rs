use std::fmt::Debug;

use super::node::{Child, Node};
use super::Slot;
use crate::error::{BindexError, ContainerId, DataNotLoaded};
use crate::Result;

/// `DataNotLoaded` for a ghost subtree, named by the separators around it.
pub(crate) fn subtree_not_loaded<K: Debug>(
    parent: ContainerId,
    lower: Option<&K>,
    upper: Option<&K>,
) -> BindexError {
    let bound = |k: Option<&K>| k.map(|k| format!("{:?}", k)).unwrap_or_default();
    DataNotLoaded {
        parent,
        key: format!("{}..{}", bound(lower), bound(upper)),
    }
    .into()
}

/// In-order walk over loaded nodes. Ends with an error at the first ghost.
struct Walk<'a, K, V> {
    stack: Vec<(&'a Node<K, V>, usize)>,
    pending: Option<BindexError>,
    finished: bool,
    id: ContainerId,
}

impl<'a, K: Debug, V> Walk<'a, K, V> {
    fn new(root: &'a Child<K, V>, id: ContainerId) -> Self {
        let mut walk = Self {
            stack: Vec::new(),
            pending: None,
            finished: false,
            id,
        };
        walk.descend(root, None, None);
        walk
    }

    /// Push the leftmost path of `child`.
    fn descend(&mut self, mut child: &'a Child<K, V>, lower: Option<&'a K>, upper: Option<&'a K>) {
        let mut upper = upper;
        loop {
            match child {
                Child::Ghost(_) => {
                    self.pending = Some(subtree_not_loaded(self.id, lower, upper));
                    return;
                }
                Child::Live(node) => {
                    self.stack.push((&**node, 0));
                    if node.is_leaf() {
                        return;
                    }
                    upper = node.keys.first().or(upper);
                    child = &node.children[0];
                }
            }
        }
    }

    fn fail(&mut self, err: BindexError) -> Option<Result<(&'a K, &'a Slot<V>)>> {
        self.finished = true;
        self.stack.clear();
        Some(Err(err))
    }
}

impl<'a, K: Debug, V> Iterator for Walk<'a, K, V> {
    type Item = Result<(&'a K, &'a Slot<V>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(err) = self.pending.take() {
            return self.fail(err);
        }
        loop {
            let top = match self.stack.last_mut() {
                Some(top) => top,
                None => {
                    self.finished = true;
                    return None;
                }
            };
            let node: &'a Node<K, V> = top.0;
            let i = top.1;
            if i < node.keys.len() {
                top.1 += 1;
                if !node.is_leaf() {
                    // the subtree after key i comes next
                    let upper = node.keys.get(i + 1);
                    self.descend(&node.children[i + 1], Some(&node.keys[i]), upper);
                }
                return Some(Ok((&node.keys[i], &node.vals[i])));
            }
            self.stack.pop();
        }
    }
}

/// Entries of a tree in key order.
pub struct Iter<'a, K, V> {
    walk: Walk<'a, K, V>,
    done: bool,
}

impl<'a, K: Debug, V> Iter<'a, K, V> {
    pub(crate) fn new(root: &'a Child<K, V>, id: ContainerId) -> Self {
        Self {
            walk: Walk::new(root, id),
            done: false,
        }
    }
}

impl<'a, K: Debug, V> Iterator for Iter<'a, K, V> {
    type Item = Result<(&'a K, &'a V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.walk.next()? {
            Ok((key, Slot::Live { value, .. })) => Some(Ok((key, value))),
            Ok((key, Slot::Bare(_))) => {
                self.done = true;
                Some(Err(DataNotLoaded::new(self.walk.id, key).into()))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Keys of a tree in order.
pub struct Keys<'a, K, V> {
    walk: Walk<'a, K, V>,
}

impl<'a, K: Debug, V> Keys<'a, K, V> {
    pub(crate) fn new(root: &'a Child<K, V>, id: ContainerId) -> Self {
        Self {
            walk: Walk::new(root, id),
        }
    }
}

impl<'a, K: Debug, V> Iterator for Keys<'a, K, V> {
    type Item = Result<&'a K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.walk.next().map(|item| item.map(|(key, _)| key))
    }
}
