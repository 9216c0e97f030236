use shared_memory::ShmemError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionTxError {
    #[error("fifo capacity {0} is not a power of two")]
    CapacityNotPowerOfTwo(usize),
    #[error("shared memory fifo file does not exist")]
    NonExistingFile,
    #[error("preexisting shared memory fifo too small: have {0}, need {1}")]
    TooSmall(usize, usize),
    #[error("shmem error: {0}")]
    Shmem(#[from] ShmemError),
}
