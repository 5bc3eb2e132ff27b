/* Key database: compiled information about every recognised key of an open
 * device. Entry order matches render-target order; iterators and indices
 * stay valid for the database's whole lifetime. Key groups reference entries
 * by index and are invalidated by dropping the database they came from. */

use crate::device::LedBlock;
use crate::layout::LayoutDescription;
use crate::scancodes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    /* offset into render targets */
    pub index: usize,
    /* id within the device block it came from */
    pub block_id: u16,
    pub key_id: u8,
    /* linux input event code, 0 when none */
    pub key_code: u32,
    pub name: String,
    /* bounding box in layout coordinates */
    pub rect: Rect,
}

#[derive(Debug, Default)]
pub struct KeyDatabase {
    keys: Vec<Key>,
    bounds: Rect,
}

impl KeyDatabase {
    pub fn new(keys: Vec<Key>) -> Self {
        let bounds = Self::compute_bounds(&keys);
        Self { keys, bounds }
    }

    /* Compile the database for a device: one entry per key of every block,
     * in device-reported order. Layout entries supply names and geometry;
     * keys the layout does not know fall back to the static tables. */
    pub fn build(blocks: &[LedBlock], layout: &LayoutDescription) -> Self {
        let mut keys = Vec::new();
        let mut index = 0usize;

        for block in blocks {
            for &key_id in &block.key_ids {
                let block_id = block.info.id;
                let layout_key = layout
                    .keys
                    .iter()
                    .find(|k| k.block == block_id && k.code == key_id);

                let name = layout_key
                    .and_then(|k| k.name.clone())
                    .unwrap_or_else(|| scancodes::key_name(block_id, key_id));
                let rect = layout_key.map(|k| k.rect).unwrap_or_default();

                keys.push(Key {
                    index,
                    block_id,
                    key_id,
                    key_code: scancodes::keycode(block_id, key_id),
                    name,
                    rect,
                });
                index += 1;
            }
        }
        Self::new(keys)
    }

    pub fn find_key_code(&self, key_code: u32) -> Option<&Key> {
        if key_code == 0 {
            return None;
        }
        self.keys.iter().find(|k| k.key_code == key_code)
    }

    /* Case-sensitive name lookup. */
    pub fn find_name(&self, name: &str) -> Option<&Key> {
        self.keys.iter().find(|k| k.name == name)
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /* Distance between two key centers, in layout units. */
    pub fn distance(&self, a: &Key, b: &Key) -> u32 {
        let center = |k: &Key| {
            (
                (k.rect.x0 + k.rect.x1) as f64 / 2.0,
                (k.rect.y0 + k.rect.y1) as f64 / 2.0,
            )
        };
        let (ax, ay) = center(a);
        let (bx, by) = center(b);
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt().round() as u32
    }

    /* Build a named group from key names; unknown names are skipped. */
    pub fn make_group<'a>(
        &self,
        name: impl Into<String>,
        key_names: impl IntoIterator<Item = &'a str>,
    ) -> KeyGroup {
        let keys = key_names
            .into_iter()
            .filter_map(|n| self.find_name(n))
            .map(|k| k.index)
            .collect();
        KeyGroup { name: name.into(), keys }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Key> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Key> {
        self.keys.get(index)
    }

    fn compute_bounds(keys: &[Key]) -> Rect {
        let mut positioned = keys.iter().filter(|k| k.rect != Rect::default());
        let Some(first) = positioned.next() else {
            return Rect::default();
        };
        let mut bounds = first.rect;
        for key in positioned {
            bounds.x0 = bounds.x0.min(key.rect.x0);
            bounds.y0 = bounds.y0.min(key.rect.y0);
            bounds.x1 = bounds.x1.max(key.rect.x1);
            bounds.y1 = bounds.y1.max(key.rect.y1);
        }
        bounds
    }
}

impl std::ops::Index<usize> for KeyDatabase {
    type Output = Key;
    fn index(&self, index: usize) -> &Key {
        &self.keys[index]
    }
}

/* A named subset of database keys, stored as stable indices. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGroup {
    name: String,
    keys: Vec<usize>,
}

impl KeyGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indices(&self) -> &[usize] {
        &self.keys
    }

    pub fn contains(&self, index: usize) -> bool {
        self.keys.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
