use std::ffi::CStr;
use std::mem::align_of;
use std::mem::size_of;
use std::ops::Deref;
use std::slice;


/// Perform a binary search on a slice, returning the index of the match
/// (if found) or the one of the previous item (if any), taking into
/// account duplicates (reporting the first match).
///
/// This functionality is useful for cases where we compare elements
/// with a size, such as symbols or ranges: an address to search for can
/// be covered by an entry whose start is before the address itself.
pub(crate) fn find_match_or_lower_bound_by_key<T, U, F>(
    slice: &[T],
    item: U,
    mut f: F,
) -> Option<usize>
where
    U: Ord,
    F: FnMut(&T) -> U,
{
    let idx = slice.partition_point(|e| f(e) < item);

    // At this point `idx` references the first item greater or equal to
    // the one we are looking for.

    if let Some(e) = slice.get(idx) {
        // If the item at `idx` is equal to what we were looking for, we
        // are trivially done, as it's guaranteed to be the first one to
        // match.
        if f(e) == item {
            return Some(idx)
        }
    }

    // Otherwise `idx` points to a "greater" item. Hence, we pick the
    // previous one, but then have to scan backwards for as long as we
    // see this one item, so that we end up reporting the index of the
    // first of all equal ones.
    let idx = idx.checked_sub(1)?;
    let cmp_e = f(slice.get(idx)?);

    for i in (0..idx).rev() {
        let e = slice.get(i)?;
        if f(e) != cmp_e {
            return Some(i + 1)
        }
    }
    Some(idx)
}


/// A marker trait for "plain old data" data types.
///
/// # Safety
/// Only safe to implement for types that are valid for any bit pattern.
pub(crate) unsafe trait Pod {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}


/// A trait providing utility functions for reading data from a byte
/// buffer.
pub(crate) trait ReadRaw<'data> {
    /// Ensure that `len` bytes are available for consumption.
    fn ensure(&self, len: usize) -> Option<()>;

    /// Consume and return `len` bytes.
    fn read_slice(&mut self, len: usize) -> Option<&'data [u8]>;

    /// Read a NUL terminated string.
    fn read_cstr(&mut self) -> Option<&'data CStr>;

    /// Read anything implementing `Pod`.
    #[inline]
    fn read_pod<T>(&mut self) -> Option<T>
    where
        T: Pod,
    {
        let data = self.read_slice(size_of::<T>())?;
        // SAFETY: `T` is `Pod` and hence valid for any bit pattern. The
        //         pointer is guaranteed to be valid and to point to
        //         memory of at least `sizeof(T)` bytes.
        let value = unsafe { data.as_ptr().cast::<T>().read_unaligned() };
        Some(value)
    }

    /// Read a reference to something implementing `Pod`.
    #[inline]
    fn read_pod_ref<T>(&mut self) -> Option<&'data T>
    where
        T: Pod,
    {
        let data = self.read_slice(size_of::<T>())?;
        let ptr = data.as_ptr();

        if ptr.align_offset(align_of::<T>()) == 0 {
            // SAFETY: `T` is `Pod` and hence valid for any bit pattern.
            //         The pointer is guaranteed to be valid and to point
            //         to memory of at least `sizeof(T)` bytes. We know
            //         it is properly aligned because we checked that.
            unsafe { ptr.cast::<T>().as_ref() }
        } else {
            None
        }
    }

    /// Read a reference to a slice of something implementing `Pod`.
    #[inline]
    fn read_pod_slice_ref<T>(&mut self, count: usize) -> Option<&'data [T]>
    where
        T: Pod,
    {
        let data = self.read_slice(size_of::<T>().checked_mul(count)?)?;
        let ptr = data.as_ptr();

        if ptr.align_offset(align_of::<T>()) == 0 {
            // SAFETY: `T` is `Pod` and hence valid for any bit pattern.
            //         The pointer is guaranteed to be valid and to point
            //         to memory of at least `count * sizeof(T)` bytes.
            //         We know it is properly aligned because we checked
            //         that.
            Some(unsafe { slice::from_raw_parts(ptr.cast::<T>(), count) })
        } else {
            None
        }
    }

    /// Read a `u32` value.
    #[inline]
    fn read_u32(&mut self) -> Option<u32> {
        self.read_pod::<u32>()
    }
}

impl<'data> ReadRaw<'data> for &'data [u8] {
    #[inline]
    fn ensure(&self, len: usize) -> Option<()> {
        if len > self.len() {
            return None
        }
        Some(())
    }

    #[inline]
    fn read_slice(&mut self, len: usize) -> Option<&'data [u8]> {
        self.ensure(len)?;
        let (a, b) = self.split_at(len);
        *self = b;
        Some(a)
    }

    #[inline]
    fn read_cstr(&mut self) -> Option<&'data CStr> {
        let idx = self.iter().position(|byte| *byte == b'\0')?;
        CStr::from_bytes_with_nul(self.read_slice(idx + 1)?).ok()
    }
}


/// A byte buffer whose start is aligned to an 8 byte boundary, suitable
/// for backing zero-copy ELF parsing of data that was read (as opposed
/// to mapped) into memory.
pub(crate) struct AlignedBytes {
    data: Vec<u64>,
    len: usize,
}

impl AlignedBytes {
    pub fn new(bytes: &[u8]) -> Self {
        let len = bytes.len();
        let mut data = vec![0u64; len.div_ceil(size_of::<u64>())];
        // SAFETY: The destination is valid for `len` bytes and the two
        //         regions cannot overlap, as we just allocated one of
        //         them.
        let () = unsafe {
            slice::from_raw_parts_mut(data.as_mut_ptr().cast::<u8>(), len).copy_from_slice(bytes)
        };
        Self { data, len }
    }
}

impl Deref for AlignedBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: The allocation is valid for at least `len` bytes.
        unsafe { slice::from_raw_parts(self.data.as_ptr().cast::<u8>(), self.len) }
    }
}


#[cfg(test)]
mod tests {
    use super::*;


    /// Test that we correctly binary search for a lower bound.
    #[test]
    fn search_lower_bound() {
        let data: [u64; 0] = [];
        assert_eq!(find_match_or_lower_bound_by_key(&data, 0, |x| *x), None);

        let data = [5];
        assert_eq!(find_match_or_lower_bound_by_key(&data, 4, |x| *x), None);
        assert_eq!(find_match_or_lower_bound_by_key(&data, 5, |x| *x), Some(0));
        assert_eq!(find_match_or_lower_bound_by_key(&data, 6, |x| *x), Some(0));

        let data = [4, 5, 5, 5, 5];
        assert_eq!(find_match_or_lower_bound_by_key(&data, 5, |x| *x), Some(1));

        let data = [1, 4, 42, 43, 99];
        assert_eq!(find_match_or_lower_bound_by_key(&data, 0, |x| *x), None);
        assert_eq!(find_match_or_lower_bound_by_key(&data, 1, |x| *x), Some(0));
        assert_eq!(find_match_or_lower_bound_by_key(&data, 5, |x| *x), Some(1));
        assert_eq!(find_match_or_lower_bound_by_key(&data, 98, |x| *x), Some(3));
        assert_eq!(find_match_or_lower_bound_by_key(&data, 1337, |x| *x), Some(4));
    }

    /// Check that we can read a NUL terminated string from a slice.
    #[test]
    fn cstr_reading() {
        let mut slice = b"abc\x001234".as_slice();

        let cstr = slice.read_cstr().unwrap();
        assert_eq!(cstr.to_bytes(), b"abc");

        // No terminating NUL byte.
        let mut slice = b"abc".as_slice();
        assert_eq!(slice.read_cstr(), None);
    }

    /// Check that `AlignedBytes` preserves contents and is aligned for
    /// 8 byte reads.
    #[test]
    fn aligned_bytes() {
        let bytes = AlignedBytes::new(b"0123456789");
        assert_eq!(&*bytes, b"0123456789");
        assert_eq!(bytes.as_ptr().align_offset(align_of::<u64>()), 0);

        let bytes = AlignedBytes::new(b"");
        assert_eq!(&*bytes, b"");
    }

    /// Check that we can read pod references from an aligned buffer.
    #[test]
    fn pod_ref_reading() {
        let bytes = AlignedBytes::new(&0x1337u64.to_ne_bytes());
        let mut slice = &*bytes;
        assert_eq!(slice.read_pod_ref::<u64>(), Some(&0x1337));
    }
}
