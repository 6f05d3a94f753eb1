use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use hdf5_metno::types::VarLenUnicode;
use hdf5_metno::{File, Group, H5Type};
use log::info;
use tokio::task;

use crate::config::defs::{PipelineError, COUNT_TOOL_TAG, FEATURE_TYPE_PEAKS, PEAK_COUNT_SUFFIX};
use crate::utils::command::count_tool::{arg_generator, CountToolConfig};
use crate::utils::command::run_tool;
use crate::utils::counts::CountMatrix;
use crate::utils::file::{buffered_writer, sample_path};

/// Serializes one sample's count matrix into `out_dir` and returns the artifact path.
pub trait MatrixWriter: Send + Sync {
    fn write_matrix<'a>(&'a self, matrix: Arc<CountMatrix>, out_dir: &'a Path) -> BoxFuture<'a, Result<PathBuf, PipelineError>>;
}


/// Native writer: 10x-style CSC HDF5, columns are barcodes, rows are peaks.
pub struct Hdf5MatrixWriter;

impl MatrixWriter for Hdf5MatrixWriter {
    fn write_matrix<'a>(&'a self, matrix: Arc<CountMatrix>, out_dir: &'a Path) -> BoxFuture<'a, Result<PathBuf, PipelineError>> {
        let path = sample_path(out_dir, &matrix.sample, &format!("{}.h5", PEAK_COUNT_SUFFIX), '_');
        Box::pin(async move {
            std::fs::create_dir_all(out_dir)?;
            let h5_path = path.clone();
            task::spawn_blocking(move || write_matrix_h5(&matrix, &h5_path))
                .await
                .map_err(|e| PipelineError::MatrixWrite(format!("HDF5 writer task failed: {}", e)))??;
            info!("Wrote {}", path.display());
            Ok(path)
        })
    }
}

fn h5_err(e: hdf5_metno::Error) -> PipelineError {
    PipelineError::MatrixWrite(e.to_string())
}

fn to_varlen(values: &[String]) -> Result<Vec<VarLenUnicode>, PipelineError> {
    values
        .iter()
        .map(|s| {
            s.parse::<VarLenUnicode>()
                .map_err(|e| PipelineError::MatrixWrite(format!("Invalid string '{}': {}", s, e)))
        })
        .collect()
}

fn write_dataset<T: H5Type>(group: &Group, name: &str, values: &[T]) -> Result<(), PipelineError> {
    group
        .new_dataset_builder()
        .with_data(values)
        .create(name)
        .map_err(h5_err)?;
    Ok(())
}

fn write_scalar_attr(file: &File, name: &str, value: &str) -> Result<(), PipelineError> {
    let value = to_varlen(&[value.to_string()])?.remove(0);
    file.new_attr::<VarLenUnicode>()
        .shape(())
        .create(name)
        .map_err(h5_err)?
        .write_scalar(&value)
        .map_err(h5_err)?;
    Ok(())
}

/// Column-compressed layout of the entries: (data, row indices, column pointers).
/// Entries arrive ordered by (region, barcode); a stable counting sort by barcode keeps
/// row indices ascending inside each column.
pub fn to_csc(matrix: &CountMatrix) -> (Vec<u64>, Vec<i64>, Vec<i64>) {
    let ncols = matrix.barcodes.len();
    let mut indptr = vec![0i64; ncols + 1];
    for e in &matrix.entries {
        indptr[e.barcode as usize + 1] += 1;
    }
    for i in 0..ncols {
        indptr[i + 1] += indptr[i];
    }

    let mut next: Vec<i64> = indptr[..ncols].to_vec();
    let mut data = vec![0u64; matrix.entries.len()];
    let mut indices = vec![0i64; matrix.entries.len()];
    for e in &matrix.entries {
        let slot = &mut next[e.barcode as usize];
        data[*slot as usize] = e.count;
        indices[*slot as usize] = e.region as i64;
        *slot += 1;
    }
    (data, indices, indptr)
}

/// Writes the matrix with `matrix/{data,indices,indptr,shape,barcodes}`,
/// `matrix/features/{id,name,feature_type,genome}`, and root attributes `sample`, `species`.
pub fn write_matrix_h5(matrix: &CountMatrix, path: &Path) -> Result<(), PipelineError> {
    let file = File::create(path).map_err(h5_err)?;
    let group = file.create_group("matrix").map_err(h5_err)?;

    let (data, indices, indptr) = to_csc(matrix);
    let (nrows, ncols) = matrix.shape();
    write_dataset(&group, "data", &data)?;
    write_dataset(&group, "indices", &indices)?;
    write_dataset(&group, "indptr", &indptr)?;
    write_dataset(&group, "shape", &[nrows as i64, ncols as i64])?;
    write_dataset(&group, "barcodes", &to_varlen(&matrix.barcodes)?)?;

    let features = group.create_group("features").map_err(h5_err)?;
    let ids = to_varlen(&matrix.features)?;
    write_dataset(&features, "id", &ids)?;
    write_dataset(&features, "name", &ids)?;
    let feature_type = to_varlen(&[FEATURE_TYPE_PEAKS.to_string()])?.remove(0);
    write_dataset(&features, "feature_type", &vec![feature_type; nrows])?;
    let genome = to_varlen(&[matrix.species.clone()])?.remove(0);
    write_dataset(&features, "genome", &vec![genome; nrows])?;

    write_scalar_attr(&file, "sample", &matrix.sample)?;
    write_scalar_attr(&file, "species", &matrix.species)?;
    Ok(())
}


/// Writes the grouped count table and hands it to an external counting tool.
pub struct CountToolWriter {
    pub program: String,
}

/// Grouped count table: region_id, barcode, count per line.
pub fn write_count_table(matrix: &CountMatrix, path: &Path) -> Result<(), PipelineError> {
    let mut writer = buffered_writer(path)?;
    for (region, barcode, count) in matrix.rows() {
        writeln!(writer, "{}\t{}\t{}", region, barcode, count)?;
    }
    writer.flush()?;
    Ok(())
}

impl MatrixWriter for CountToolWriter {
    fn write_matrix<'a>(&'a self, matrix: Arc<CountMatrix>, out_dir: &'a Path) -> BoxFuture<'a, Result<PathBuf, PipelineError>> {
        Box::pin(async move {
            std::fs::create_dir_all(out_dir)?;
            let scratch = tempfile::Builder::new().prefix("count_table").tempdir()?;
            let table = sample_path(scratch.path(), &matrix.sample, "count_table.tsv", '_');
            write_count_table(&matrix, &table)?;

            let config = CountToolConfig {
                species: matrix.species.clone(),
                out_prefix: format!("{}_{}", matrix.sample, PEAK_COUNT_SUFFIX),
            };
            let args = arg_generator(&config, &table, out_dir);
            run_tool(COUNT_TOOL_TAG, &self.program, &args).await?;
            info!("{} wrote matrix for {} into {}", self.program, matrix.sample, out_dir.display());
            Ok(out_dir.to_path_buf())
        })
    }
}
