use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;

use capture_protocol::Pixel;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

const STENCIL_ID_COUNT: usize = u8::MAX as usize + 1;

pub const WALL_STENCIL_ID: u8 = 133;
pub const TREE_STENCIL_ID: u8 = 250;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub tag: String,
    pub color: Pixel,
}

impl ClassEntry {
    pub fn new(tag: impl Into<String>, color: Pixel) -> Self {
        Self {
            tag: tag.into(),
            color,
        }
    }
}

/// Dense lookup result: an index into [`ClassMap::tags`] plus the display color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassSlot {
    pub tag_index: u16,
    pub color: Pixel,
}

/// Stencil id to (tag, display color) table.
///
/// Several stencil ids may share a tag as long as they agree on its color.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<u8, ClassEntry>",
    into = "BTreeMap<u8, ClassEntry>"
)]
pub struct ClassMap {
    entries: BTreeMap<u8, ClassEntry>,
    tags: Vec<String>,
    slots: Box<[Option<ClassSlot>; STENCIL_ID_COUNT]>,
}

impl ClassMap {
    pub fn new(entries: BTreeMap<u8, ClassEntry>) -> Result<Self, ConfigError> {
        let mut slots = Box::new([None; STENCIL_ID_COUNT]);
        let mut tag_colors: BTreeMap<&str, Pixel> = BTreeMap::new();
        for (&stencil_id, entry) in &entries {
            if entry.tag.is_empty() {
                return Err(ConfigError::EmptyTag { stencil_id });
            }
            match tag_colors.entry(entry.tag.as_str()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(entry.color);
                }
                Entry::Occupied(occupied) => {
                    if *occupied.get() != entry.color {
                        return Err(ConfigError::ConflictingTagColor {
                            tag: entry.tag.clone(),
                        });
                    }
                }
            }
        }

        let tags: Vec<String> = tag_colors.keys().map(|tag| (*tag).to_owned()).collect();
        for (&stencil_id, entry) in &entries {
            let tag_index = tags
                .binary_search(&entry.tag)
                .expect("class map tag collected above");
            slots[usize::from(stencil_id)] = Some(ClassSlot {
                tag_index: u16::try_from(tag_index).expect("class map tag index overflow"),
                color: entry.color,
            });
        }

        Ok(Self {
            entries,
            tags,
            slots,
        })
    }

    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            tags: Vec::new(),
            slots: Box::new([None; STENCIL_ID_COUNT]),
        }
    }

    #[inline]
    pub fn lookup(&self, stencil_id: u8) -> Option<ClassSlot> {
        self.slots[usize::from(stencil_id)]
    }

    pub fn tag(&self, tag_index: u16) -> &str {
        &self.tags[usize::from(tag_index)]
    }

    /// Distinct tags in sorted order.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn get(&self, stencil_id: u8) -> Option<&ClassEntry> {
        self.entries.get(&stencil_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &ClassEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }
}

impl Default for ClassMap {
    fn default() -> Self {
        let entries = BTreeMap::from([
            (WALL_STENCIL_ID, ClassEntry::new("Wall", Pixel::RED)),
            (TREE_STENCIL_ID, ClassEntry::new("Tree", Pixel::BLUE)),
        ]);
        Self::new(entries).expect("default class map is valid")
    }
}

impl fmt::Debug for ClassMap {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_map().entries(self.entries.iter()).finish()
    }
}

impl TryFrom<BTreeMap<u8, ClassEntry>> for ClassMap {
    type Error = ConfigError;

    fn try_from(entries: BTreeMap<u8, ClassEntry>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<ClassMap> for BTreeMap<u8, ClassEntry> {
    fn from(map: ClassMap) -> Self {
        map.entries
    }
}
