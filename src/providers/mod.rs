pub mod chembl;
pub mod community;
pub mod http;
pub mod patents;
pub mod pubchem;
pub mod pubmed;

use std::sync::Arc;

use crate::client::SourceClient;
use crate::domain::SourceKind;
use crate::source::CompoundSource;

use self::chembl::ChemblSource;
use self::community::{PsychonautSource, WikipediaSource};
use self::http::HttpTransport;
use self::patents::PatentSource;
use self::pubchem::PubChemSource;
use self::pubmed::PubmedSource;

/// The network-backed source for `kind`.
pub fn source_for(kind: SourceKind, http: &HttpTransport) -> Arc<dyn CompoundSource> {
    let http = http.clone();
    match kind {
        SourceKind::Pubchem => Arc::new(PubChemSource::new(http)),
        SourceKind::Chembl => Arc::new(ChemblSource::new(http)),
        SourceKind::Pubmed => Arc::new(PubmedSource::new(http)),
        SourceKind::Patents => Arc::new(PatentSource::new(http)),
        SourceKind::Psychonaut => Arc::new(PsychonautSource::new(http)),
        SourceKind::Wikipedia => Arc::new(WikipediaSource::new(http)),
    }
}

/// One client per requested source, sharing a single transport.
pub fn http_clients(kinds: &[SourceKind], http: &HttpTransport) -> Vec<SourceClient> {
    kinds
        .iter()
        .map(|kind| SourceClient::new(source_for(*kind, http)))
        .collect()
}
