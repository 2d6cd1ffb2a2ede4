//! Executable memory.
//!
//! A single [CodeArena] is `mmap`ed up front and carved into fixed-size [MachineCodeBlock]s. A
//! builder checks a block out of the [CodePool] with [CodePool::open_mc], writes code into it
//! sequentially, and hands it back with [CodePool::close_mc]: a block with enough space left is
//! recycled so that the next builder continues writing after the existing code. Code is never
//! freed individually; the whole arena is unmapped when the pool is dropped.

use crate::error::CompilationError;
use libc::{mmap, mprotect, munmap, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};
use std::{
    env,
    ffi::c_void,
    fmt::Write as _,
    fs::File,
    io::Write as _,
    path::Path,
};

/// A window onto executable memory that code is written into sequentially.
#[derive(Debug)]
pub(crate) struct MachineCodeBlock {
    /// The absolute address of the first byte of this block.
    base: usize,
    /// How many bytes this block spans.
    size: usize,
    /// The offset of the next byte to be written.
    pos: usize,
    /// The offset up to which bytes have been dumped.
    last_dump: usize,
}

impl MachineCodeBlock {
    /// A block writing over the existing code in `start..end`. The memory must belong to a live
    /// [CodeArena].
    pub(crate) fn over(start: usize, end: usize) -> Self {
        assert!(start <= end);
        Self {
            base: start,
            size: end - start,
            pos: 0,
            last_dump: 0,
        }
    }

    /// The absolute address the next byte will be written to.
    pub(crate) fn tell(&self) -> usize {
        self.base + self.pos
    }

    /// How many bytes can still be written.
    pub(crate) fn free(&self) -> usize {
        self.size - self.pos
    }

    /// Append `bytes` at the cursor.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> Result<(), CompilationError> {
        if bytes.len() > self.free() {
            return Err(CompilationError::CodeBlockOverflow(bytes.len(), self.free()));
        }
        unsafe {
            ((self.base + self.pos) as *mut u8)
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        self.pos += bytes.len();
        Ok(())
    }

    /// Finish a generation session on this block: dump everything written since the last dump.
    pub(crate) fn done(&mut self, dumper: &mut CodeDumper) {
        if self.last_dump < self.pos {
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    (self.base + self.last_dump) as *const u8,
                    self.pos - self.last_dump,
                )
            };
            dumper.dump(self.base, self.last_dump, bytes);
            self.last_dump = self.pos;
        }
    }
}

/// One `mmap`ed region of read/write/execute memory.
struct CodeArena {
    buf: *mut u8,
    len: usize,
    /// How many bytes at the start of the arena have been carved into blocks.
    carved: usize,
}

impl CodeArena {
    fn new(len: usize) -> Result<Self, CompilationError> {
        let len = len.next_multiple_of(page_size::get());
        let buf = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_ANON | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if buf == MAP_FAILED {
            return Err(CompilationError::ResourceExhausted(
                format!("cannot map {len} bytes of code memory").into(),
            ));
        }
        if unsafe { mprotect(buf, len, PROT_EXEC | PROT_READ | PROT_WRITE) } != 0 {
            unsafe { munmap(buf, len) };
            return Err(CompilationError::ResourceExhausted(
                "cannot make code memory executable".into(),
            ));
        }
        Ok(Self {
            buf: buf as *mut u8,
            len,
            carved: 0,
        })
    }

    fn carve(&mut self, size: usize) -> Option<MachineCodeBlock> {
        if self.len - self.carved < size {
            return None;
        }
        let base = self.buf as usize + self.carved;
        self.carved += size;
        Some(MachineCodeBlock {
            base,
            size,
            pos: 0,
            last_dump: 0,
        })
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        unsafe { munmap(self.buf as *mut c_void, self.len) };
    }
}

/// Blocks with less than this many bytes free are never recycled.
pub(crate) const MIN_RECYCLE_FREE: usize = 256;

/// Hands out [MachineCodeBlock]s, recycling partly used ones.
pub(crate) struct CodePool {
    arena: CodeArena,
    block_size: usize,
    /// Blocks handed back with enough free space to be reused, most recent last.
    free: Vec<MachineCodeBlock>,
}

impl CodePool {
    pub(crate) fn new(arena_size: usize, block_size: usize) -> Result<Self, CompilationError> {
        Ok(Self {
            arena: CodeArena::new(arena_size)?,
            block_size,
            free: Vec::new(),
        })
    }

    /// Check out a block for exclusive writing.
    pub(crate) fn open_mc(&mut self) -> Result<MachineCodeBlock, CompilationError> {
        if let Some(mc) = self.free.pop() {
            return Ok(mc);
        }
        self.arena.carve(self.block_size).ok_or_else(|| {
            CompilationError::ResourceExhausted(
                format!(
                    "code arena of {} bytes exhausted",
                    self.arena.len
                )
                .into(),
            )
        })
    }

    /// Return a block. Blocks with less than an eighth of their space left (or less than
    /// [MIN_RECYCLE_FREE] bytes) are retired.
    pub(crate) fn close_mc(&mut self, mc: MachineCodeBlock) {
        if mc.free() >= (self.block_size / 8).max(MIN_RECYCLE_FREE) {
            self.free.push(mc);
        }
    }
}

/// Writes newly generated code to the file named by `TSD_CODE_DUMP` for offline inspection.
pub(crate) struct CodeDumper {
    out: Option<File>,
}

impl CodeDumper {
    /// Create a dumper writing to `path`. If the file cannot be created, dumping is silently
    /// disabled.
    pub(crate) fn new(path: Option<&Path>) -> Self {
        let out = path.and_then(|p| File::create(p).ok()).and_then(|mut f| {
            let exe = env::current_exe()
                .map(|x| x.display().to_string())
                .unwrap_or_default();
            f.write_all(format!("SYS_EXECUTABLE {exe}\n").as_bytes())
                .ok()
                .map(|_| f)
        });
        Self { out }
    }

    fn dump(&mut self, base: usize, offset: usize, bytes: &[u8]) {
        if let Some(f) = &mut self.out {
            let line = format_dump_line(base, offset, bytes);
            if f.write_all(line.as_bytes()).is_err() {
                self.out = None;
            }
        }
    }
}

/// Format one `CODE_DUMP` line: a `:` follows every byte at an address `p` with `p & 3 == 3`.
fn format_dump_line(base: usize, offset: usize, bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        write!(hex, "{b:02X}").ok();
        if (base + offset + i) & 3 == 3 {
            hex.push(':');
        }
    }
    format!("CODE_DUMP @{base:x} +{offset}  {hex}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_overflow() {
        let mut pool = CodePool::new(4096, 1024).unwrap();
        let mut mc = pool.open_mc().unwrap();
        let start = mc.tell();
        mc.write(&[0x90; 1000]).unwrap();
        assert_eq!(mc.tell(), start + 1000);
        match mc.write(&[0x90; 100]) {
            Err(CompilationError::CodeBlockOverflow(100, 24)) => (),
            x => panic!("{x:?}"),
        }
        assert_eq!(unsafe { *(start as *const u8) }, 0x90);
    }

    #[test]
    fn recycling() {
        let mut pool = CodePool::new(4096, 1024).unwrap();
        let mut mc = pool.open_mc().unwrap();
        mc.write(&[0xC3; 10]).unwrap();
        let pos = mc.tell();
        pool.close_mc(mc);
        // A mostly empty block comes straight back, continuing after the existing code.
        let mut mc = pool.open_mc().unwrap();
        assert_eq!(mc.tell(), pos);
        mc.write(&[0xC3; 1000]).unwrap();
        pool.close_mc(mc);
        // A nearly full block is retired.
        let mc = pool.open_mc().unwrap();
        assert_ne!(mc.tell(), pos + 1000);
    }

    #[test]
    fn exhaustion() {
        let mut pool = CodePool::new(page_size::get(), page_size::get()).unwrap();
        let _mc = pool.open_mc().unwrap();
        assert!(matches!(
            pool.open_mc(),
            Err(CompilationError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn over_region() {
        let mut pool = CodePool::new(4096, 1024).unwrap();
        let mut mc = pool.open_mc().unwrap();
        let start = mc.tell();
        mc.write(&[0u8; 16]).unwrap();
        let mut r = MachineCodeBlock::over(start + 4, start + 8);
        r.write(&[1, 2, 3, 4]).unwrap();
        assert!(r.write(&[5]).is_err());
        assert_eq!(unsafe { *((start + 5) as *const u8) }, 2);
    }

    #[test]
    fn dump_format() {
        assert_eq!(
            format_dump_line(0x1000, 2, &[0x48, 0x89, 0xC3]),
            "CODE_DUMP @1000 +2  4889:C3\n"
        );
        assert_eq!(
            format_dump_line(0x1000, 0, &[0x90, 0x90, 0x90, 0x90, 0xC3]),
            "CODE_DUMP @1000 +0  90909090:C3\n"
        );
    }

    #[test]
    fn dump_file() {
        let path = env::temp_dir().join(format!("tsrt-dump-{}", std::process::id()));
        let mut dumper = CodeDumper::new(Some(&path));
        let mut pool = CodePool::new(4096, 1024).unwrap();
        let mut mc = pool.open_mc().unwrap();
        mc.write(&[0xC3]).unwrap();
        mc.done(&mut dumper);
        mc.done(&mut dumper);
        drop(dumper);
        let s = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let lines = s.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("SYS_EXECUTABLE "));
        assert!(lines[1].starts_with("CODE_DUMP @"));
        assert!(lines[1].ends_with("  C3") || lines[1].ends_with("  C3:"));
    }
}
