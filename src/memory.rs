use crate::exception::Exception;
use crate::word::{Cell, CELL};
use byteorder::{ByteOrder, NativeEndian};

/// Cells in the flash arena.
pub const SZ_FLASH: usize = 16384;
/// Bytes per scratch buffer.
pub const SZ_INBUF: usize = 127;
/// Slots in the circular temp-buffer queue.
pub const NUM_TMP_BUFS: usize = 4;

/// Address of the `base` system variable.
pub const ADDR_BASE: usize = CELL;
/// Address of the `trace` system variable.
pub const ADDR_TRACE: usize = 2 * CELL;
/// Address of the error-code system variable.
pub const ADDR_ERR: usize = 3 * CELL;
/// Address of the signal-number system variable.
pub const ADDR_SIG: usize = 4 * CELL;
/// First address above the system variables; `forget` resets HERE to this.
pub const ARENA_BASE: usize = 5 * CELL;

/// The flash arena.
///
/// A contiguous byte image addressed by cell-sized offsets. Compiled code
/// and data grow upward from `ARENA_BASE` through `here`; interned names
/// and saved strings grow downward from the top through `string_data`.
/// Address zero holds a canary cell so a null address is never valid.
///
/// Keeping the arena as plain bytes indexed by offset means no host pointer
/// is ever stored in a cell and the whole image is relocatable.
pub struct Flash {
    inner: Vec<u8>,
    here: usize,
    string_data: usize,
    seal: Option<usize>,
}

impl Flash {
    pub fn new() -> Flash {
        let cap = SZ_FLASH * CELL;
        let mut flash = Flash {
            inner: vec![0; cap],
            here: ARENA_BASE,
            string_data: cap,
            seal: None,
        };
        flash.put_cell(ADDR_BASE, 10).unwrap();
        flash
    }

    /// Upper limit of address space.
    pub fn limit(&self) -> usize {
        self.inner.len()
    }

    /// Next free space.
    pub fn here(&self) -> usize {
        self.here
    }

    pub fn set_here(&mut self, pos: usize) -> Result<(), Exception> {
        // here is allowed to be 1 place after the last usable address.
        if ARENA_BASE <= pos && pos <= self.limit() {
            self.here = pos;
            Ok(())
        } else {
            Err(Exception::Range)
        }
    }

    /// Bytes left between compiled code and the string cache.
    pub fn freespace(&self) -> isize {
        self.string_data as isize - self.here as isize
    }

    /// Reserve `n` cells of data space; negative `n` releases.
    pub fn allot(&mut self, n: Cell) -> Result<(), Exception> {
        let here = self.here as isize + n * CELL as isize;
        if here < ARENA_BASE as isize {
            return Err(Exception::Range);
        }
        if here >= self.string_data as isize {
            return Err(Exception::NoSpace);
        }
        self.set_here(here as usize)
    }

    /// First aligned address greater than or equal to `pos`.
    pub fn aligned(pos: usize) -> usize {
        (pos + CELL - 1) & CELL.wrapping_neg()
    }

    pub fn has(&self, addr: usize, len: usize) -> bool {
        addr.checked_add(len).map_or(false, |end| end <= self.limit())
    }

    fn check(&self, addr: usize, len: usize) -> Result<(), Exception> {
        if addr == 0 {
            Err(Exception::NullPointer)
        } else if self.has(addr, len) {
            Ok(())
        } else {
            Err(Exception::Range)
        }
    }

    // Cell and byte access

    pub fn get_cell(&self, addr: usize) -> Result<Cell, Exception> {
        self.check(addr, CELL)?;
        Ok(NativeEndian::read_int(&self.inner[addr..], CELL) as Cell)
    }

    pub fn put_cell(&mut self, addr: usize, v: Cell) -> Result<(), Exception> {
        self.check(addr, CELL)?;
        NativeEndian::write_int(&mut self.inner[addr..], v as i64, CELL);
        Ok(())
    }

    pub fn get_half(&self, addr: usize) -> Result<Cell, Exception> {
        self.check(addr, CELL / 2)?;
        Ok(NativeEndian::read_uint(&self.inner[addr..], CELL / 2) as Cell)
    }

    pub fn put_half(&mut self, addr: usize, v: Cell) -> Result<(), Exception> {
        self.check(addr, CELL / 2)?;
        let mask = (1u64 << (CELL * 4)) - 1;
        NativeEndian::write_uint(&mut self.inner[addr..], v as u64 & mask, CELL / 2);
        Ok(())
    }

    pub fn get_u8(&self, addr: usize) -> Result<Cell, Exception> {
        self.check(addr, 1)?;
        Ok(self.inner[addr] as Cell)
    }

    pub fn put_u8(&mut self, addr: usize, v: Cell) -> Result<(), Exception> {
        self.check(addr, 1)?;
        self.inner[addr] = v as u8;
        Ok(())
    }

    /// Compile one cell at HERE.
    pub fn compile_cell(&mut self, v: Cell) -> Result<(), Exception> {
        if self.freespace() > CELL as isize {
            let here = self.here;
            self.put_cell(here, v)?;
            self.here += CELL;
            Ok(())
        } else {
            Err(Exception::NoSpace)
        }
    }

    pub fn fill(&mut self, addr: usize, len: usize, byte: u8) -> Result<(), Exception> {
        self.check(addr, len)?;
        for b in &mut self.inner[addr..addr + len] {
            *b = byte;
        }
        Ok(())
    }

    pub fn copy(&mut self, src: usize, dst: usize, len: usize) -> Result<(), Exception> {
        self.check(src, len)?;
        self.check(dst, len)?;
        self.inner.copy_within(src..src + len, dst);
        Ok(())
    }

    /// Write `s` plus a terminating null at `addr` without moving HERE.
    pub fn put_str(&mut self, addr: usize, s: &str) -> Result<(), Exception> {
        let bytes = s.as_bytes();
        self.check(addr, bytes.len() + 1)?;
        self.inner[addr..addr + bytes.len()].copy_from_slice(bytes);
        self.inner[addr + bytes.len()] = 0;
        Ok(())
    }

    /// Read the null-terminated string at `addr`.
    pub fn get_str(&self, addr: usize) -> Result<&str, Exception> {
        self.check(addr, 1)?;
        let tail = &self.inner[addr..];
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(Exception::BadString)?;
        std::str::from_utf8(&tail[..len]).map_err(|_| Exception::BadString)
    }

    pub fn bytes(&self, addr: usize, len: usize) -> Result<&[u8], Exception> {
        self.check(addr, len)?;
        Ok(&self.inner[addr..addr + len])
    }

    // String cache

    /// Start of the interned string region.
    pub fn string_data(&self) -> usize {
        self.string_data
    }

    /// Intern `tag`, growing the cache downward. Returns the new pointer.
    pub fn str_cache(&mut self, tag: &str) -> Result<usize, Exception> {
        let len = tag.len() + 1;
        if self.freespace() <= len as isize {
            return Err(Exception::NoSpace);
        }
        self.string_data -= len;
        let addr = self.string_data;
        self.put_str(addr, tag)?;
        Ok(addr)
    }

    /// Release the most recently cached string.
    pub fn str_uncache(&mut self) -> Result<(), Exception> {
        if self.string_data >= self.limit() {
            return Err(Exception::Unsave);
        }
        let len = self.get_str(self.string_data)?.len() + 1;
        self.string_data += len;
        Ok(())
    }

    /// Record the current cache top as the immutable low-water mark.
    pub fn str_seal(&mut self) {
        self.seal = Some(self.string_data);
    }

    /// Wipe compiled code and unsealed strings.
    pub fn wipe(&mut self) {
        self.here = ARENA_BASE;
        self.string_data = self.seal.unwrap_or_else(|| self.limit());
    }
}

/// Round-robin queue of formatting scratch slots.
///
/// Slots live in the arena just above the system variables so nested
/// formatting never clobbers an outer formatter's buffer.
#[derive(Debug, Copy, Clone, Default)]
pub struct TempBufs {
    base: usize,
    next: usize,
}

impl TempBufs {
    /// Allot the scratch slots at HERE and remember where they landed.
    pub fn create(flash: &mut Flash) -> Result<TempBufs, Exception> {
        let base = flash.here();
        let bytes = NUM_TMP_BUFS * SZ_INBUF;
        let cells = (bytes + CELL - 1) / CELL;
        flash.allot(cells as Cell)?;
        flash.fill(base, bytes, 0)?;
        Ok(TempBufs { base, next: 0 })
    }

    /// Hand out the next slot as (address, length).
    pub fn take(&mut self) -> (usize, usize) {
        let addr = self.base + self.next * SZ_INBUF;
        self.next = (self.next + 1) % NUM_TMP_BUFS;
        (addr, SZ_INBUF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cells() {
        let mut flash = Flash::new();
        let here = flash.here();
        flash.compile_cell(-42).unwrap();
        assert_eq!(flash.get_cell(here).unwrap(), -42);
        assert_eq!(flash.here(), here + CELL);
    }

    #[test]
    fn test_null_and_range() {
        let flash = Flash::new();
        assert_eq!(flash.get_cell(0), Err(Exception::NullPointer));
        assert_eq!(flash.get_cell(flash.limit()), Err(Exception::Range));
    }

    #[test]
    fn test_base_preset() {
        let flash = Flash::new();
        assert_eq!(flash.get_cell(ADDR_BASE).unwrap(), 10);
    }

    #[test]
    fn test_str_cache_lifo() {
        let mut flash = Flash::new();
        let top = flash.string_data();
        let a = flash.str_cache("alpha").unwrap();
        let b = flash.str_cache("be").unwrap();
        assert!(b < a && a < top);
        assert_eq!(flash.get_str(a).unwrap(), "alpha");
        assert_eq!(flash.get_str(b).unwrap(), "be");
        flash.str_uncache().unwrap();
        assert_eq!(flash.string_data(), a);
        flash.str_uncache().unwrap();
        assert_eq!(flash.string_data(), top);
        assert_eq!(flash.str_uncache(), Err(Exception::Unsave));
    }

    #[test]
    fn test_seal_survives_wipe() {
        let mut flash = Flash::new();
        flash.str_cache("tty").unwrap();
        flash.str_seal();
        let sealed = flash.string_data();
        flash.str_cache("gone").unwrap();
        flash.compile_cell(7).unwrap();
        flash.wipe();
        assert_eq!(flash.string_data(), sealed);
        assert_eq!(flash.here(), ARENA_BASE);
    }

    #[test]
    fn test_no_space() {
        let mut flash = Flash::new();
        loop {
            match flash.compile_cell(1) {
                Ok(()) => {}
                Err(e) => {
                    assert_eq!(e, Exception::NoSpace);
                    break;
                }
            }
        }
        assert!(flash.freespace() <= CELL as isize);
    }

    #[test]
    fn test_aligned() {
        assert_eq!(Flash::aligned(0), 0);
        assert_eq!(Flash::aligned(1), CELL);
        assert_eq!(Flash::aligned(CELL), CELL);
        assert_eq!(Flash::aligned(CELL + 1), 2 * CELL);
    }

    #[test]
    fn test_temp_bufs_rotate() {
        let mut flash = Flash::new();
        let mut bufs = TempBufs::create(&mut flash).unwrap();
        let (first, len) = bufs.take();
        assert_eq!(len, SZ_INBUF);
        let mut last = first;
        for _ in 1..NUM_TMP_BUFS {
            let (addr, _) = bufs.take();
            assert_eq!(addr, last + SZ_INBUF);
            last = addr;
        }
        assert_eq!(bufs.take().0, first);
    }
}
