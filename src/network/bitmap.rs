use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const WORD_BITS: u64 = 64;

/// Fixed-capacity bit vector. The size is rounded up to a power of two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    size: u64,
    words: Vec<u64>,
}

impl Bitmap {
    pub fn new(size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let size = size.checked_next_power_of_two().ok_or(Error::InvalidSize)?;
        let len = usize::try_from(size.div_ceil(WORD_BITS)).map_err(|_| Error::InvalidSize)?;
        Ok(Self {
            size,
            words: vec![0; len],
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set(&mut self, pos: u64) -> Result<()> {
        let (idx, mask) = self.locate(pos)?;
        self.words[idx] |= mask;
        Ok(())
    }

    pub fn clear(&mut self, pos: u64) -> Result<()> {
        let (idx, mask) = self.locate(pos)?;
        self.words[idx] &= !mask;
        Ok(())
    }

    pub fn is_set(&self, pos: u64) -> Result<bool> {
        let (idx, mask) = self.locate(pos)?;
        Ok(self.words[idx] & mask != 0)
    }

    /// Lowest unset position, scanning words from index 0 upwards.
    pub fn find_first_unset(&self) -> Option<u64> {
        for (i, word) in self.words.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let pos = i as u64 * WORD_BITS + u64::from((!word).trailing_zeros());
            if pos < self.size {
                return Some(pos);
            }
        }
        None
    }

    pub fn count_set(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    pub fn reset(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    fn locate(&self, pos: u64) -> Result<(usize, u64)> {
        if pos >= self.size {
            return Err(Error::InvalidPosition);
        }
        Ok(((pos / WORD_BITS) as usize, 1 << (pos % WORD_BITS)))
    }
}

/// Two-level allocator: subnets of the base range, then addresses within a
/// subnet. An address map exists only for subnets that were allocated at
/// least once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpNetBitmap {
    subnet_bitmap: Bitmap,
    ip_size: u64,
    subnet_ip_maps: HashMap<u64, Bitmap>,
}

impl IpNetBitmap {
    pub fn new(subnet_count: u64, ip_size: u64) -> Result<Self> {
        let subnet_bitmap = Bitmap::new(subnet_count)?;
        if ip_size == 0 {
            return Err(Error::InvalidSize);
        }
        let ip_size = ip_size.checked_next_power_of_two().ok_or(Error::InvalidSize)?;
        Ok(Self {
            subnet_bitmap,
            ip_size,
            subnet_ip_maps: HashMap::new(),
        })
    }

    pub fn subnet_count(&self) -> u64 {
        self.subnet_bitmap.size()
    }

    pub fn ip_size(&self) -> u64 {
        self.ip_size
    }

    /// Takes the lowest free subnet and returns a copy of its address map
    /// together with its index.
    pub fn allocate_subnet(&mut self) -> Result<(Bitmap, u64)> {
        let pos = self.subnet_bitmap.find_first_unset().ok_or(Error::OutOfRange)?;
        self.subnet_bitmap.set(pos)?;
        let ip_map = match self.subnet_ip_maps.get(&pos) {
            Some(map) => map.clone(),
            None => {
                let map = Bitmap::new(self.ip_size)?;
                self.subnet_ip_maps.insert(pos, map.clone());
                map
            }
        };
        Ok((ip_map, pos))
    }

    pub fn release_subnet(&mut self, pos: u64) -> Result<()> {
        if !self.subnet_bitmap.is_set(pos)? {
            return Err(Error::InvalidPosition);
        }
        self.subnet_bitmap.clear(pos)?;
        if let Some(map) = self.subnet_ip_maps.get_mut(&pos) {
            map.reset();
        }
        Ok(())
    }

    pub fn allocate_ip_in_subnet(&mut self, pos: u64) -> Result<u64> {
        if !self.subnet_bitmap.is_set(pos)? {
            return Err(Error::InvalidPosition);
        }
        let map = self
            .subnet_ip_maps
            .get_mut(&pos)
            .ok_or(Error::InvalidPosition)?;
        let ip = map.find_first_unset().ok_or(Error::OutOfRange)?;
        map.set(ip)?;
        Ok(ip)
    }

    /// Marks a subnet found on disk as taken, adopting its address map.
    pub fn restore_subnet(&mut self, pos: u64, ip_map: Bitmap) -> Result<()> {
        self.subnet_bitmap.set(pos)?;
        self.subnet_ip_maps.insert(pos, ip_map);
        Ok(())
    }

    pub fn is_subnet_allocated(&self, pos: u64) -> bool {
        self.subnet_bitmap.is_set(pos).unwrap_or(false)
    }
}
