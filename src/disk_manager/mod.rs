use crate::pages::traits::Serialize;
use crate::pages::{Page, PageId, INVALID_PAGE, PAGE_SIZE};
use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

#[cfg(test)]
pub fn test_path() -> String {
    use uuid::Uuid;

    let id = Uuid::new_v4(); // Generate a unique UUID
    format!("data/test/test_{}/", id)
}

/// One file per page under a directory path, the file named after the
/// page id. All I/O is whole-page and synchronous.
#[derive(Debug)]
pub struct DiskManager {
    path: PathBuf,
}

impl DiskManager {
    pub fn new(path: &str) -> Self {
        let path = Path::new(path);

        std::fs::create_dir_all(path).unwrap();

        Self {
            path: path.to_path_buf(),
        }
    }

    fn page_path(&self, page_id: PageId) -> PathBuf {
        self.path.join(page_id.to_string())
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        if page.get_page_id() == INVALID_PAGE {
            return Err(anyhow!("Asked to write a page with invalid ID"));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false) // don't overwrite existing file
            .open(self.page_path(page.get_page_id()))?;

        file.write_all(page.as_bytes())
            .context("page written to disk")?;

        Ok(())
    }

    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        if page_id == INVALID_PAGE {
            return Err(anyhow!("Asked to read a page with invalid ID"));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .open(self.page_path(page_id))
            .context("page file opened for reading")?;

        let mut buffer = [0u8; PAGE_SIZE];
        file.read_exact(&mut buffer)
            .context("page read from disk")?;
        let mut page = Page::from_bytes(&buffer);
        page.set_page_id(page_id);

        Ok(page)
    }

    /// Deallocate a page. Removing a page that was never written is fine,
    /// deletion must stay idempotent.
    pub fn remove_page(&self, page_id: PageId) -> Result<()> {
        if page_id == INVALID_PAGE {
            return Err(anyhow!("Asked to remove a page with invalid ID"));
        }

        match std::fs::remove_file(self.page_path(page_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("page file removed"),
        }
    }
}
