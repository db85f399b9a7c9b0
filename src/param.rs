/// Size of a block-device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of the disk block cache.
pub const NBUF: usize = 64;

/// Direct sector slots in an on-disk inode.
pub const NDIRECT: usize = 123;

/// Sector indices held by one index block.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Largest file, in sectors.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Identifies an on-disk inode.
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// Sector of the free-map file's inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Longest directory entry name.
pub const DIRSIZ: usize = 14;

/// Page size in bytes.
pub const PGSIZE: usize = 4096;

/// Sectors covered by one page.
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// Physical frames available to user pages.
pub const NFRAME: usize = 64;

/// Swap slots tracked by the swap table.
pub const NSWAP: usize = 1024;

/// Lowest user virtual address (start of the code segment).
pub const USER_BASE: usize = 0x0804_8000;

/// First address past user space.
pub const USER_TOP: usize = 0xC000_0000;

/// Largest stack a process may grow.
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;

/// A push may touch at most this far below the stack pointer.
pub const STACK_HEURISTIC: usize = 32;
