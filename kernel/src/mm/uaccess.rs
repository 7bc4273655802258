// Safe User-Memory Access
//
// Lets kernel code read and write addresses supplied by untrusted user code
// without pre-validating them and without the possibility of a kernel crash.
//
// Key responsibilities:
// - Reject addresses at or above the user/kernel split without touching them
// - Perform every remaining access through a fault-capable single-byte
//   primitive, so an unmapped page becomes a value instead of a fault
// - Build bulk copies, word reads, chunked streaming, and bounded string
//   copies out of that byte primitive
//
// Design principles:
// - Per-byte probing keeps fault handling local: the page-fault handler only
//   needs to recognise the faulting instruction, never which bytes were
//   expected to fail
// - A short copy is a count, not an error; callers compare it against what
//   they asked for and decide whether to reject the request
// - The hardware trick is confined to the `FaultingAccess` trait; this module
//   contains no architecture-specific code
//
// Error handling:
// - `InvalidUserAddress` carries the first address that could not be touched
// - `UserStrError` distinguishes faults, missing terminators, and bad UTF-8

use core::str;

use crate::log_debug;
use crate::mm::config::{VmConfig, MAX_COPY_CHUNK};

const LOG_ORIGIN: &str = "uaccess";

/// Single-byte memory access that survives faults.
///
/// # Safety
///
/// Implementors must guarantee that `load` and `store` never bring the kernel
/// down for any address below the user boundary: a fault during the access
/// has to be recovered and reported as `None` / `false`.
pub unsafe trait FaultingAccess: Sync {
    fn load(&self, addr: usize) -> Option<u8>;
    fn store(&self, addr: usize, value: u8) -> bool;
}

unsafe impl<T: FaultingAccess + ?Sized> FaultingAccess for &T {
    fn load(&self, addr: usize) -> Option<u8> {
        (**self).load(addr)
    }

    fn store(&self, addr: usize, value: u8) -> bool {
        (**self).store(addr, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidUserAddress {
    pub addr: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStrError {
    /// A byte of the string could not be read.
    Fault(InvalidUserAddress),
    /// No terminator within the destination buffer.
    TooLong,
    /// The bytes before the terminator are not valid UTF-8.
    NotUtf8,
}

pub struct UserMemory<A> {
    access: A,
    user_top: usize,
    chunk: usize,
}

impl<A: FaultingAccess> UserMemory<A> {
    pub fn new(access: A, config: &VmConfig) -> Self {
        Self {
            access,
            user_top: config.user_top,
            chunk: config.effective_chunk(),
        }
    }

    pub fn user_top(&self) -> usize {
        self.user_top
    }

    pub fn probe_byte(&self, addr: usize) -> Result<u8, InvalidUserAddress> {
        if addr >= self.user_top {
            return Err(InvalidUserAddress { addr });
        }
        self.access.load(addr).ok_or(InvalidUserAddress { addr })
    }

    pub fn poke_byte(&self, addr: usize, value: u8) -> Result<(), InvalidUserAddress> {
        if addr >= self.user_top || !self.access.store(addr, value) {
            return Err(InvalidUserAddress { addr });
        }
        Ok(())
    }

    /// Copies up to `dst.len()` bytes from user address `src`.
    ///
    /// Returns how many bytes were copied; fewer than requested means the
    /// byte at `src + returned` was invalid.
    pub fn copy_from_user(&self, dst: &mut [u8], src: usize) -> usize {
        for (offset, slot) in dst.iter_mut().enumerate() {
            let byte = src
                .checked_add(offset)
                .ok_or(InvalidUserAddress { addr: usize::MAX })
                .and_then(|addr| self.probe_byte(addr));

            match byte {
                Ok(byte) => *slot = byte,
                Err(err) => {
                    log_debug!(
                        LOG_ORIGIN,
                        "Short copy from user: {}/{} bytes, fault at {:#X}",
                        offset,
                        dst.len(),
                        err.addr
                    );
                    return offset;
                }
            }
        }
        dst.len()
    }

    /// Copies `src` to user address `dst`, stopping at the first invalid byte.
    pub fn copy_to_user(&self, dst: usize, src: &[u8]) -> usize {
        for (offset, &byte) in src.iter().enumerate() {
            let written = dst
                .checked_add(offset)
                .is_some_and(|addr| self.poke_byte(addr, byte).is_ok());

            if !written {
                log_debug!(
                    LOG_ORIGIN,
                    "Short copy to user: {}/{} bytes",
                    offset,
                    src.len()
                );
                return offset;
            }
        }
        src.len()
    }

    /// Reads a little-endian machine word, e.g. a syscall argument on the user stack.
    pub fn read_user_u64(&self, addr: usize) -> Result<u64, InvalidUserAddress> {
        let mut bytes = [0u8; 8];
        let copied = self.copy_from_user(&mut bytes, addr);
        if copied < bytes.len() {
            return Err(InvalidUserAddress {
                addr: addr.wrapping_add(copied),
            });
        }
        Ok(u64::from_le_bytes(bytes))
    }

    /// Streams `len` user bytes at `src` into `sink` through a kernel bounce buffer.
    ///
    /// `sink` returns how many of the offered bytes it consumed. Streaming
    /// stops at the first short copy or partial consumption. Returns the total
    /// number of bytes consumed by `sink`.
    pub fn stream_from_user<F>(&self, src: usize, len: usize, mut sink: F) -> usize
    where
        F: FnMut(&[u8]) -> usize,
    {
        let mut buffer = [0u8; MAX_COPY_CHUNK];
        let mut consumed = 0;
        let mut remaining = len;

        while remaining > 0 {
            let attempt = remaining.min(self.chunk);
            let Some(cursor) = src.checked_add(len - remaining) else {
                break;
            };

            let copied = self.copy_from_user(&mut buffer[..attempt], cursor);
            let written = sink(&buffer[..copied]).min(copied);
            consumed += written;

            if written < attempt {
                break;
            }
            remaining -= copied;
        }

        consumed
    }

    /// Copies a NUL-terminated user string into `buf` and returns it without
    /// the terminator. The terminator must fit in `buf`.
    pub fn copy_cstr_from_user<'b>(
        &self,
        src: usize,
        buf: &'b mut [u8],
    ) -> Result<&'b str, UserStrError> {
        for index in 0..buf.len() {
            let addr = src
                .checked_add(index)
                .ok_or(UserStrError::Fault(InvalidUserAddress { addr: usize::MAX }))?;
            let byte = self.probe_byte(addr).map_err(UserStrError::Fault)?;

            if byte == 0 {
                return str::from_utf8(&buf[..index]).map_err(|_| UserStrError::NotUtf8);
            }
            buf[index] = byte;
        }

        Err(UserStrError::TooLong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::UserSpace;
    use proptest::prelude::*;

    const BASE: usize = 0x40_0000;

    fn memory(space: &UserSpace) -> UserMemory<&UserSpace> {
        UserMemory::new(space, &VmConfig::new())
    }

    #[test]
    fn probe_at_or_above_boundary_never_touches_hardware() {
        let space = UserSpace::new();
        let user = memory(&space);

        let top = user.user_top();
        assert_eq!(user.probe_byte(top), Err(InvalidUserAddress { addr: top }));
        assert_eq!(user.probe_byte(usize::MAX), Err(InvalidUserAddress { addr: usize::MAX }));
        assert!(user.poke_byte(top + 1, 7).is_err());
        assert_eq!(space.hardware_accesses(), 0);

        assert!(user.probe_byte(top - 1).is_err());
        assert_eq!(space.hardware_accesses(), 1);
    }

    #[test]
    fn probe_and_poke_mapped_bytes() {
        let space = UserSpace::new();
        space.map(BASE, &[1, 2, 3]);
        let user = memory(&space);

        assert_eq!(user.probe_byte(BASE + 1), Ok(2));
        assert_eq!(user.poke_byte(BASE + 2, 9), Ok(()));
        assert_eq!(space.read(BASE, 3), vec![1, 2, 9]);

        let unmapped = BASE + 0x10_0000;
        assert_eq!(user.probe_byte(unmapped), Err(InvalidUserAddress { addr: unmapped }));
        assert_eq!(user.poke_byte(unmapped, 1), Err(InvalidUserAddress { addr: unmapped }));
    }

    #[test]
    fn full_copy_returns_requested_length() {
        let space = UserSpace::new();
        let data: Vec<u8> = (0..100).collect();
        space.map(BASE, &data);
        let user = memory(&space);

        let mut dst = [0u8; 100];
        assert_eq!(user.copy_from_user(&mut dst, BASE), 100);
        assert_eq!(&dst[..], &data[..]);
    }

    #[test]
    fn copy_crossing_into_unmapped_page_is_short() {
        let space = UserSpace::new();
        let page_end = BASE + crate::mm::pmm::PAGE_SIZE;
        space.map(page_end - 4, &[0xA, 0xB, 0xC, 0xD]);
        let user = memory(&space);

        let mut dst = [0u8; 16];
        assert_eq!(user.copy_from_user(&mut dst, page_end - 4), 4);
        assert_eq!(&dst[..4], &[0xA, 0xB, 0xC, 0xD]);
    }

    #[test]
    fn copy_to_user_stops_at_first_invalid_byte() {
        let space = UserSpace::new();
        space.map(BASE, &[0; 3]);
        space.unmap_byte(BASE + 2);
        let user = memory(&space);

        assert_eq!(user.copy_to_user(BASE, &[5, 6, 7, 8]), 2);
        assert_eq!(space.read(BASE, 2), vec![5, 6]);
    }

    #[test]
    fn reads_user_words_little_endian() {
        let space = UserSpace::new();
        space.map(BASE, &0x1122_3344_5566_7788u64.to_le_bytes());
        space.map(BASE + 8, &[0xFF; 4]);
        let user = memory(&space);

        assert_eq!(user.read_user_u64(BASE), Ok(0x1122_3344_5566_7788));
        assert_eq!(
            user.read_user_u64(BASE + 8),
            Err(InvalidUserAddress { addr: BASE + 12 })
        );
    }

    #[test]
    fn stream_delivers_in_bounded_chunks() {
        let space = UserSpace::new();
        let data: Vec<u8> = (0..40u8).collect();
        space.map(BASE, &data);
        let user = UserMemory::new(&space, &VmConfig::new().with_copy_chunk(16));

        let mut chunks = Vec::new();
        let consumed = user.stream_from_user(BASE, data.len(), |chunk| {
            chunks.push(chunk.to_vec());
            chunk.len()
        });

        assert_eq!(consumed, 40);
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![16, 16, 8]
        );
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn stream_stops_after_short_copy_or_partial_sink() {
        let space = UserSpace::new();
        space.map(BASE, &[1; 20]);
        let user = UserMemory::new(&space, &VmConfig::new().with_copy_chunk(8));

        let mut calls = 0;
        let consumed = user.stream_from_user(BASE, 32, |chunk| {
            calls += 1;
            chunk.len()
        });
        assert_eq!(consumed, 20);
        assert_eq!(calls, 3);

        let consumed = user.stream_from_user(BASE, 20, |chunk| chunk.len() / 2);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn cstr_copy_handles_terminator_length_and_faults() {
        let space = UserSpace::new();
        space.map(BASE, b"echo hi\0");
        space.map(BASE + 0x100, b"abc");
        space.map(BASE + 0x200, &[0xFF, 0xFE, 0]);
        let user = memory(&space);

        let mut buf = [0u8; 16];
        assert_eq!(user.copy_cstr_from_user(BASE, &mut buf), Ok("echo hi"));

        let mut tiny = [0u8; 4];
        assert_eq!(
            user.copy_cstr_from_user(BASE, &mut tiny),
            Err(UserStrError::TooLong)
        );

        assert_eq!(
            user.copy_cstr_from_user(BASE + 0x100, &mut buf),
            Err(UserStrError::Fault(InvalidUserAddress { addr: BASE + 0x103 }))
        );
        assert_eq!(
            user.copy_cstr_from_user(BASE + 0x200, &mut buf),
            Err(UserStrError::NotUtf8)
        );
    }

    proptest! {
        #[test]
        fn short_copy_count_matches_first_invalid_offset(
            data in proptest::collection::vec(any::<u8>(), 1..64),
            hole in any::<prop::sample::Index>(),
        ) {
            let space = UserSpace::new();
            space.map(BASE, &data);
            let k = hole.index(data.len());
            space.unmap_byte(BASE + k);
            let user = memory(&space);

            let mut dst = vec![0u8; data.len()];
            let copied = user.copy_from_user(&mut dst, BASE);

            prop_assert_eq!(copied, k);
            prop_assert_eq!(&dst[..k], &data[..k]);
        }
    }
}
