//! Upstream symbol reference data port (market cap, sector, index membership).

use crate::domain::cohort::SymbolProfile;
use crate::domain::error::RsrankError;

pub trait CohortPort {
    fn symbol_profiles(&self) -> Result<Vec<SymbolProfile>, RsrankError>;
}
