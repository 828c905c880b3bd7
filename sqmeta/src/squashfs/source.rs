use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom};
use std::rc::Rc;

#[derive(Debug)]
struct Backing<R> {
    reader: R,
    owner: usize,   // Cursor the reader is currently positioned for; 0 for none
}

/// One seekable reader shared by several independent cursors.
///
/// The inode reader, the directory reader and the data reader of an image all work on the same
/// file but at unrelated positions. Each [`SourceCursor`] remembers its own position, and the
/// backing reader is only re-seeked when a different cursor than the last one uses it.
#[derive(Debug)]
pub struct SharedSource<R> {
    backing: Rc<RefCell<Backing<R>>>,
    cursors: usize,
}

impl<R: Read + Seek> SharedSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            backing: Rc::new(RefCell::new(Backing { reader, owner: 0 })),
            cursors: 0,
        }
    }

    pub fn cursor(&mut self) -> SourceCursor<R> {
        self.cursors += 1;
        SourceCursor { backing: Rc::clone(&self.backing), id: self.cursors, pos: 0 }
    }
}

/// A position in a [`SharedSource`]
#[derive(Debug)]
pub struct SourceCursor<R> {
    backing: Rc<RefCell<Backing<R>>>,
    id: usize,
    pos: u64,
}

impl<R: Seek> SourceCursor<R> {
    fn with_reader<T, F>(&mut self, f: F) -> io::Result<T>
    where F: FnOnce(&mut R, &mut u64) -> io::Result<T>
    {
        let mut backing = self.backing.borrow_mut();
        if backing.owner != self.id {
            // Invalidate first so a failed seek doesn't leave a stale owner
            backing.owner = 0;
            backing.reader.seek(SeekFrom::Start(self.pos))?;
            backing.owner = self.id;
        }
        let result = f(&mut backing.reader, &mut self.pos);
        if result.is_err() {
            backing.owner = 0;
        }
        result
    }
}

impl<R: Read + Seek> Read for SourceCursor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_reader(|reader, pos| {
            let n = reader.read(buf)?;
            *pos += n as u64;
            Ok(n)
        })
    }
}

impl<R: Seek> Seek for SourceCursor<R> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let target = match target {
            SeekFrom::Current(delta) => {
                let pos = self.pos.checked_add_signed(delta)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
                SeekFrom::Start(pos)
            },
            t => t,
        };
        self.with_reader(|reader, pos| {
            *pos = reader.seek(target)?;
            Ok(*pos)
        })
    }
}
