// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Radix trie mapping binary prefixes to subscriber handles, used to
//! dispatch a published frame to every subscriber whose registered prefix
//! matches a leading run of the frame's routing key.
//!
//! Grounded in `nitro_prefix_trie_{add,del,search}` (`original_source/src/trie.c`):
//! node-splitting insert, uncompacted delete, and a search that walks the
//! key byte by byte invoking the callback at every node along the path that
//! carries members, shortest prefix first.

use crate::error::{Error, Result};

const CHILD_COUNT: usize = 256;

struct Node<H> {
    rep: Vec<u8>,
    children: Vec<Option<Box<Node<H>>>>,
    members: Vec<H>,
}

impl<H> Node<H> {
    fn new(rep: Vec<u8>) -> Node<H> {
        Node { rep, children: (0..CHILD_COUNT).map(|_| None).collect(), members: Vec::new() }
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Maps byte-string prefixes to a (possibly repeated) set of opaque
/// subscriber handles `H`. `H` is typically a pipe token.
pub struct PrefixTrie<H> {
    root: Option<Box<Node<H>>>,
}

impl<H> Default for PrefixTrie<H> {
    fn default() -> Self {
        PrefixTrie { root: None }
    }
}

impl<H> PrefixTrie<H> {
    pub fn new() -> PrefixTrie<H> {
        PrefixTrie::default()
    }

    pub fn add(&mut self, key: &[u8], subscriber: H) {
        insert(&mut self.root, key, subscriber);
    }

    /// Invokes `callback(rep, members)` for every node on the path to `key`
    /// whose `rep` is a prefix of `key` and which carries members, ordered
    /// shortest prefix to longest.
    pub fn search<F: FnMut(&[u8], &[H])>(&self, key: &[u8], mut callback: F) {
        search(&self.root, key, &mut callback);
    }
}

impl<H: PartialEq> PrefixTrie<H> {
    /// Removes the first member entry equal to `subscriber` from the node
    /// whose `rep` exactly equals `key`. The trie is not compacted.
    pub fn delete(&mut self, key: &[u8], subscriber: &H) -> Result<()> {
        let node = find_exact_mut(&mut self.root, key).ok_or(Error::NotFound)?;
        let pos = node.members.iter().position(|m| m == subscriber).ok_or(Error::NotFound)?;
        node.members.remove(pos);
        Ok(())
    }
}

fn search<H, F: FnMut(&[u8], &[H])>(slot: &Option<Box<Node<H>>>, key: &[u8], callback: &mut F) {
    let node = match slot {
        Some(node) => node,
        None => return,
    };
    let len = node.rep.len();
    if len > key.len() || key[..len] != node.rep[..] {
        return;
    }
    if !node.members.is_empty() {
        callback(&node.rep, &node.members);
    }
    if len < key.len() {
        search(&node.children[key[len] as usize], key, callback);
    }
}

fn find_exact_mut<'a, H>(slot: &'a mut Option<Box<Node<H>>>, key: &[u8]) -> Option<&'a mut Node<H>> {
    let node = slot.as_mut()?;
    let len = node.rep.len();
    if len > key.len() || key[..len] != node.rep[..] {
        return None;
    }
    if len == key.len() {
        return Some(node);
    }
    find_exact_mut(&mut node.children[key[len] as usize], key)
}

/// Takes ownership of the slot's current occupant (if any) to sidestep
/// holding a borrow of `slot` across the `slot.take()` it would otherwise
/// need for node splitting; rebuilds and writes the result back.
fn insert<H>(slot: &mut Option<Box<Node<H>>>, key: &[u8], subscriber: H) {
    let existing = slot.take();
    *slot = Some(match existing {
        None => {
            let mut node = Node::new(key.to_vec());
            node.members.push(subscriber);
            Box::new(node)
        }
        Some(mut node) => {
            let common = common_prefix_len(&node.rep, key);
            if common == node.rep.len() && common == key.len() {
                node.members.push(subscriber);
                node
            } else if common == node.rep.len() {
                let idx = key[node.rep.len()] as usize;
                insert(&mut node.children[idx], key, subscriber);
                node
            } else if common == key.len() {
                let mut parent = Node::new(key.to_vec());
                parent.members.push(subscriber);
                let child_idx = node.rep[common] as usize;
                parent.children[child_idx] = Some(node);
                Box::new(parent)
            } else {
                let mut parent = Node::new(key[..common].to_vec());
                let old_idx = node.rep[common] as usize;
                let new_idx = key[common] as usize;
                let mut new_node = Node::new(key.to_vec());
                new_node.members.push(subscriber);
                parent.children[old_idx] = Some(node);
                parent.children[new_idx] = Some(Box::new(new_node));
                Box::new(parent)
            }
        }
    });
}
