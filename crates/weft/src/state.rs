use num_bigint::BigUint;

/// Marker for the sentinel "input not connected" offset in compiled programs.
pub const UNCONNECTED: usize = usize::MAX;

const BITS_PER_WORD: usize = 64;

/// The two planes of a signal value: the bit values themselves and, per bit,
/// whether that value is defined. An undefined bit models the simulation
/// 'X' state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Value,
    Defined,
}

pub const NUM_PLANES: usize = 2;

/// Packed two-plane bit vector. All simulation state (output port values,
/// register contents, memory words) lives in one of these, addressed by bit
/// offset ranges handed out at program compile time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitVecState {
    size: usize,
    planes: [Vec<u64>; NUM_PLANES],
}

fn word_count(bits: usize) -> usize {
    bits.div_ceil(BITS_PER_WORD)
}

fn mask(size: usize) -> u64 {
    if size >= 64 { !0 } else { (1u64 << size) - 1 }
}

impl BitVecState {
    pub fn new(size: usize) -> Self {
        let mut s = Self::default();
        s.resize(size);
        s
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn resize(&mut self, size: usize) {
        self.size = size;
        for plane in &mut self.planes {
            plane.resize(word_count(size), 0);
        }
    }

    fn plane(&self, plane: Plane) -> &[u64] {
        &self.planes[plane as usize]
    }

    fn plane_mut(&mut self, plane: Plane) -> &mut [u64] {
        &mut self.planes[plane as usize]
    }

    pub fn get(&self, plane: Plane, idx: usize) -> bool {
        debug_assert!(idx < self.size);
        (self.plane(plane)[idx / BITS_PER_WORD] >> (idx % BITS_PER_WORD)) & 1 != 0
    }

    pub fn set(&mut self, plane: Plane, idx: usize, bit: bool) {
        debug_assert!(idx < self.size);
        let word = &mut self.plane_mut(plane)[idx / BITS_PER_WORD];
        if bit {
            *word |= 1 << (idx % BITS_PER_WORD);
        } else {
            *word &= !(1 << (idx % BITS_PER_WORD));
        }
    }

    /// Reads up to 64 bits that do not cross a word boundary.
    pub fn extract_non_straddling(&self, plane: Plane, start: usize, size: usize) -> u64 {
        debug_assert!(size <= BITS_PER_WORD - start % BITS_PER_WORD);
        if size == 0 {
            return 0;
        }
        (self.plane(plane)[start / BITS_PER_WORD] >> (start % BITS_PER_WORD)) & mask(size)
    }

    /// Writes up to 64 bits that do not cross a word boundary.
    pub fn insert_non_straddling(&mut self, plane: Plane, start: usize, size: usize, value: u64) {
        debug_assert!(size <= BITS_PER_WORD - start % BITS_PER_WORD);
        if size == 0 {
            return;
        }
        let word = &mut self.plane_mut(plane)[start / BITS_PER_WORD];
        let shift = start % BITS_PER_WORD;
        *word = (*word & !(mask(size) << shift)) | ((value & mask(size)) << shift);
    }

    /// Reads up to 64 bits, straddling a word boundary if necessary.
    pub fn extract(&self, plane: Plane, start: usize, size: usize) -> u64 {
        debug_assert!(size <= BITS_PER_WORD);
        let first = (BITS_PER_WORD - start % BITS_PER_WORD).min(size);
        let mut res = self.extract_non_straddling(plane, start, first);
        if first < size {
            res |= self.extract_non_straddling(plane, start + first, size - first) << first;
        }
        res
    }

    /// Writes up to 64 bits, straddling a word boundary if necessary.
    pub fn insert(&mut self, plane: Plane, start: usize, size: usize, value: u64) {
        debug_assert!(size <= BITS_PER_WORD);
        let first = (BITS_PER_WORD - start % BITS_PER_WORD).min(size);
        self.insert_non_straddling(plane, start, first, value);
        if first < size {
            self.insert_non_straddling(plane, start + first, size - first, value >> first);
        }
    }

    pub fn set_range(&mut self, plane: Plane, offset: usize, size: usize) {
        self.fill_range(plane, offset, size, !0u64);
    }

    pub fn clear_range(&mut self, plane: Plane, offset: usize, size: usize) {
        self.fill_range(plane, offset, size, 0u64);
    }

    pub fn set_range_to(&mut self, plane: Plane, offset: usize, size: usize, bit: bool) {
        self.fill_range(plane, offset, size, if bit { !0u64 } else { 0u64 });
    }

    fn fill_range(&mut self, plane: Plane, offset: usize, size: usize, pattern: u64) {
        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(BITS_PER_WORD);
            self.insert(plane, offset + done, chunk, pattern);
            done += chunk;
        }
    }

    /// Copies `size` bits of both planes from `src` at `src_offset`. Source
    /// and destination may be the same vector as long as ranges don't overlap.
    pub fn copy_range(&mut self, dst_offset: usize, src: &BitVecState, src_offset: usize, size: usize) {
        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(BITS_PER_WORD);
            for plane in [Plane::Value, Plane::Defined] {
                let v = src.extract(plane, src_offset + done, chunk);
                self.insert(plane, dst_offset + done, chunk, v);
            }
            done += chunk;
        }
    }

    /// Copies `size` bits of both planes between two non-overlapping ranges
    /// of this vector.
    pub fn copy_range_within(&mut self, dst_offset: usize, src_offset: usize, size: usize) {
        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(BITS_PER_WORD);
            for plane in [Plane::Value, Plane::Defined] {
                let v = self.extract(plane, src_offset + done, chunk);
                self.insert(plane, dst_offset + done, chunk, v);
            }
            done += chunk;
        }
    }

    /// Extracts a sub-range as a fresh state vector.
    pub fn extract_state(&self, start: usize, size: usize) -> BitVecState {
        let mut res = BitVecState::new(size);
        res.copy_range(0, self, start, size);
        res
    }

    /// Inserts another state vector at the given offset.
    pub fn insert_state(&mut self, src: &BitVecState, offset: usize) {
        self.copy_range(offset, src, 0, src.size());
    }

    pub fn all_defined(&self, offset: usize, size: usize) -> bool {
        self.all_set(Plane::Defined, offset, size)
    }

    pub fn all_set(&self, plane: Plane, offset: usize, size: usize) -> bool {
        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(BITS_PER_WORD);
            if self.extract(plane, offset + done, chunk) != mask(chunk) {
                return false;
            }
            done += chunk;
        }
        true
    }

    pub fn all_clear(&self, plane: Plane, offset: usize, size: usize) -> bool {
        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(BITS_PER_WORD);
            if self.extract(plane, offset + done, chunk) != 0 {
                return false;
            }
            done += chunk;
        }
        true
    }

    /// Compares value and defined planes of two ranges.
    pub fn range_equal(&self, offset: usize, other: &BitVecState, other_offset: usize, size: usize) -> bool {
        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(BITS_PER_WORD);
            for plane in [Plane::Value, Plane::Defined] {
                if self.extract(plane, offset + done, chunk)
                    != other.extract(plane, other_offset + done, chunk)
                {
                    return false;
                }
            }
            done += chunk;
        }
        true
    }

    /// Reads a range of one plane into a [`BigUint`] for wide arithmetic.
    pub fn to_biguint(&self, plane: Plane, offset: usize, size: usize) -> BigUint {
        let mut words = Vec::with_capacity(word_count(size));
        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(BITS_PER_WORD);
            words.push(self.extract(plane, offset + done, chunk));
            done += chunk;
        }
        BigUint::from_slice_native(&words)
    }

    /// Writes a [`BigUint`] into a range of one plane, truncating to `size` bits.
    pub fn insert_biguint(&mut self, plane: Plane, offset: usize, size: usize, value: &BigUint) {
        let digits = value.to_u64_digits();
        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(BITS_PER_WORD);
            let word = digits.get(done / BITS_PER_WORD).copied().unwrap_or(0);
            self.insert(plane, offset + done, chunk, word);
            done += chunk;
        }
    }
}

trait FromSliceNative {
    fn from_slice_native(words: &[u64]) -> BigUint;
}

impl FromSliceNative for BigUint {
    fn from_slice_native(words: &[u64]) -> BigUint {
        let mut res = BigUint::from(0u64);
        for (i, w) in words.iter().enumerate() {
            res |= BigUint::from(*w) << (i * BITS_PER_WORD);
        }
        res
    }
}

/// A single defined bit.
pub fn bit_state(value: bool) -> BitVecState {
    let mut s = BitVecState::new(1);
    s.set(Plane::Defined, 0, true);
    s.set(Plane::Value, 0, value);
    s
}

/// A fully defined vector from the low `width` bits of `value`.
pub fn value_state(value: u64, width: usize) -> BitVecState {
    debug_assert!(width <= 64);
    let mut s = BitVecState::new(width);
    s.insert(Plane::Value, 0, width, value);
    s.set_range(Plane::Defined, 0, width);
    s
}

/// A fully undefined vector of the given width.
pub fn undefined_state(width: usize) -> BitVecState {
    BitVecState::new(width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straddling_roundtrip() {
        let mut s = BitVecState::new(200);
        s.insert(Plane::Value, 60, 20, 0xabcde);
        assert_eq!(s.extract(Plane::Value, 60, 20), 0xabcde);
        assert_eq!(s.extract(Plane::Value, 0, 60), 0);
        assert_eq!(s.extract(Plane::Value, 80, 64), 0);
    }

    #[test]
    fn range_fill_and_query() {
        let mut s = BitVecState::new(130);
        s.set_range(Plane::Defined, 1, 128);
        assert!(s.all_defined(1, 128));
        assert!(!s.all_defined(0, 130));
        s.clear_range(Plane::Defined, 64, 2);
        assert!(!s.all_defined(1, 128));
        assert!(s.all_defined(1, 63));
    }

    #[test]
    fn copy_between_offsets() {
        let src = value_state(0b1011, 4);
        let mut dst = BitVecState::new(70);
        dst.copy_range(62, &src, 0, 4);
        assert_eq!(dst.extract(Plane::Value, 62, 4), 0b1011);
        assert!(dst.all_defined(62, 4));
        assert!(!dst.all_defined(0, 62));
    }

    #[test]
    fn biguint_bridge() {
        let mut s = BitVecState::new(100);
        s.set_range(Plane::Defined, 0, 100);
        s.insert(Plane::Value, 0, 64, !0);
        s.insert(Plane::Value, 64, 36, 0x5);
        let v = s.to_biguint(Plane::Value, 0, 100);
        let expected = (BigUint::from(5u64) << 64) | BigUint::from(u64::MAX);
        assert_eq!(v, expected);

        let mut back = BitVecState::new(100);
        back.insert_biguint(Plane::Value, 0, 100, &v);
        assert_eq!(back.extract(Plane::Value, 0, 64), !0);
        assert_eq!(back.extract(Plane::Value, 64, 36), 0x5);
    }
}
