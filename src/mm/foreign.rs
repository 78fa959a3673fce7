//! Non-owning access to memory the core does not own.
//!
//! Guest RAM and shared rings are written concurrently by the guest and by
//! backend threads. These handles never claim exclusive or shared
//! ownership: every typed read is a fresh volatile load and every typed
//! write is a single fixed-width volatile store. Ordering between
//! producers is the caller's business (ring code uses explicit fences).

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use bytemuck::Pod;

use crate::error::MemoryError;

/// Bounds-checked byte view over foreign memory.
#[derive(Clone, Copy)]
pub struct ForeignData<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> ForeignData<'a> {
    /// Build a view over `len` bytes at `ptr`.
    ///
    /// # Safety
    /// `ptr..ptr+len` must stay dereferenceable for `'a`. Other parties may
    /// read and write it concurrently.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len, _marker: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(MemoryError::OutOfBounds { offset, len, size: self.len }),
        }
    }

    /// Narrow the view to `[offset, offset + len)`.
    pub fn subview(&self, offset: usize, len: usize) -> Result<ForeignData<'a>, MemoryError> {
        self.check(offset, len)?;
        // Safety: the range was checked against this view.
        Ok(unsafe { Self::from_raw_parts(NonNull::new_unchecked(self.ptr.as_ptr().add(offset)), len) })
    }

    /// Typed handle to the `T` at `offset`.
    pub fn ptr<T: Pod>(&self, offset: usize) -> Result<ForeignPtr<'a, T>, MemoryError> {
        self.check(offset, size_of::<T>())?;
        // Safety: in bounds; `ForeignPtr` copes with any alignment.
        let raw = unsafe { self.ptr.as_ptr().add(offset) } as *mut T;
        Ok(ForeignPtr { ptr: unsafe { NonNull::new_unchecked(raw) }, _marker: PhantomData })
    }

    pub fn read<T: Pod>(&self, offset: usize) -> Result<T, MemoryError> {
        Ok(self.ptr::<T>(offset)?.read())
    }

    pub fn write<T: Pod>(&self, offset: usize, val: T) -> Result<(), MemoryError> {
        self.ptr::<T>(offset)?.write(val);
        Ok(())
    }

    /// Copy `dst.len()` bytes starting at `offset` out of foreign memory.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), MemoryError> {
        self.check(offset, dst.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into foreign memory starting at `offset`.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<(), MemoryError> {
        self.check(offset, src.len())?;
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
        Ok(())
    }
}

/// Typed handle to a single foreign value.
#[derive(Clone, Copy)]
pub struct ForeignPtr<'a, T: Pod> {
    ptr: NonNull<T>,
    _marker: PhantomData<&'a T>,
}

impl<T: Pod> ForeignPtr<'_, T> {
    fn aligned(&self) -> bool {
        self.ptr.as_ptr() as usize % align_of::<T>() == 0
    }

    /// Load the current value. Unaligned locations are loaded bytewise.
    pub fn read(&self) -> T {
        if self.aligned() {
            return unsafe { ptr::read_volatile(self.ptr.as_ptr()) };
        }
        let mut val = T::zeroed();
        let src = self.ptr.as_ptr() as *const u8;
        for (i, byte) in bytemuck::bytes_of_mut(&mut val).iter_mut().enumerate() {
            *byte = unsafe { ptr::read_volatile(src.add(i)) };
        }
        val
    }

    /// Store `val`. Unaligned locations are stored bytewise.
    pub fn write(&self, val: T) {
        if self.aligned() {
            unsafe { ptr::write_volatile(self.ptr.as_ptr(), val) };
            return;
        }
        let dst = self.ptr.as_ptr() as *mut u8;
        for (i, byte) in bytemuck::bytes_of(&val).iter().enumerate() {
            unsafe { ptr::write_volatile(dst.add(i), *byte) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(buf: &mut [u8]) -> ForeignData<'_> {
        unsafe { ForeignData::from_raw_parts(NonNull::new(buf.as_mut_ptr()).unwrap(), buf.len()) }
    }

    #[test]
    fn test_typed_access() {
        let mut buf = [0u8; 16];
        let data = view(&mut buf);
        data.write::<u32>(4, 0xdead_beef).unwrap();
        assert_eq!(data.read::<u32>(4).unwrap(), 0xdead_beef);
        assert_eq!(data.read::<u8>(4).unwrap(), 0xef);
    }

    #[test]
    fn test_unaligned_access() {
        let mut buf = [0u8; 16];
        let data = view(&mut buf);
        data.write::<u64>(3, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(data.read::<u64>(3).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(buf[3], 0x08);
    }

    #[test]
    fn test_bounds() {
        let mut buf = [0u8; 8];
        let data = view(&mut buf);
        assert!(data.read::<u64>(1).is_err());
        assert!(data.write_bytes(6, &[1, 2, 3]).is_err());
        assert!(data.subview(usize::MAX, 2).is_err());
        let sub = data.subview(2, 4).unwrap();
        assert_eq!(sub.len(), 4);
        assert!(sub.read::<u32>(1).is_err());
    }
}
