use analog_core::{PipelineError, coverage::CoverageError, schema::ValidationError};

use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("{source}"))]
    Pipeline {
        #[snafu(source(from(PipelineError, Box::new)))]
        source: Box<PipelineError>,
    },

    #[snafu(display("Master table coverage is inconsistent: {source}"))]
    Coverage { source: CoverageError },

    #[snafu(display("Failed to count page views: {source}"))]
    Analyze { source: ValidationError },
}
