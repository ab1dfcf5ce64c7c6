// Pieces shared by the FAT family
pub mod timestamps;
