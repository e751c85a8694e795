//! Reading count tables and haplotypes, writing chain outputs.
use std::path::Path;

use csv::{ReaderBuilder, Writer};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis};

use crate::error::{HaploError, Result};
use crate::state::{tau_bases, tau_from_bases};
use crate::util::{base_index, BASES, NUM_BASES};

/// Variant sites with per-sample nucleotide counts
#[derive(Clone, Debug)]
pub struct VariantTable {
    pub contigs: Vec<String>,
    pub positions: Vec<String>,
    pub sample_names: Vec<String>,
    /// V x S x 4
    pub counts: Array3<u32>,
}

impl VariantTable {
    pub fn n_variants(&self) -> usize {
        self.counts.len_of(Axis(0))
    }

    pub fn n_samples(&self) -> usize {
        self.counts.len_of(Axis(1))
    }
}

/// Read a count table: header row, then `contig,position` followed by four
/// columns (A, C, G, T) per sample
pub fn read_variant_table(path: &Path) -> Result<VariantTable> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let header = reader.headers()?.clone();
    if header.len() < 2 + NUM_BASES || (header.len() - 2) % NUM_BASES != 0 {
        return Err(HaploError::parse(
            1,
            format!(
                "expected contig, position and 4 columns per sample, found {} columns",
                header.len()
            ),
        ));
    }
    let n_samples = (header.len() - 2) / NUM_BASES;
    let sample_names: Vec<String> = (0..n_samples)
        .map(|s| {
            let name = &header[2 + s * NUM_BASES];
            name.strip_suffix("-A").unwrap_or(name).to_string()
        })
        .collect();

    let mut contigs = Vec::new();
    let mut positions = Vec::new();
    let mut flat: Vec<u32> = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record = record?;
        let line = row_index + 2;
        if record.len() != header.len() {
            return Err(HaploError::parse(
                line,
                format!("{} columns, header has {}", record.len(), header.len()),
            ));
        }
        contigs.push(record[0].to_string());
        positions.push(record[1].to_string());
        for field in record.iter().skip(2) {
            let count = field
                .trim()
                .parse::<u32>()
                .map_err(|_| HaploError::parse(line, format!("invalid count '{}'", field)))?;
            flat.push(count);
        }
    }
    let n_variants = contigs.len();
    let counts = Array3::from_shape_vec((n_variants, n_samples, NUM_BASES), flat)
        .map_err(|e| HaploError::shape(e.to_string()))?;
    Ok(VariantTable {
        contigs,
        positions,
        sample_names,
        counts,
    })
}

/// Read haplotypes: header row, then `contig,position` followed by one base letter per genome
pub fn read_tau(path: &Path) -> Result<Array3<u8>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let n_genomes = reader.headers()?.len().saturating_sub(2);
    if n_genomes == 0 {
        return Err(HaploError::parse(1, "no haplotype columns"));
    }
    let mut flat = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record = record?;
        let line = row_index + 2;
        if record.len() != n_genomes + 2 {
            return Err(HaploError::parse(line, "haplotype row has the wrong number of columns"));
        }
        for field in record.iter().skip(2) {
            let base = field
                .trim()
                .chars()
                .next()
                .and_then(base_index)
                .ok_or_else(|| HaploError::parse(line, format!("invalid base '{}'", field)))?;
            flat.push(base);
        }
    }
    let n_variants = flat.len() / n_genomes;
    let bases = Array2::from_shape_vec((n_variants, n_genomes), flat)
        .map_err(|e| HaploError::shape(e.to_string()))?;
    Ok(tau_from_bases(&bases))
}

fn site_labels(table: &VariantTable, v: usize) -> [String; 2] {
    [table.contigs[v].clone(), table.positions[v].clone()]
}

/// One base letter per genome for every variant
pub fn write_tau(path: &Path, table: &VariantTable, tau: &Array3<u8>) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    let bases = tau_bases(tau);
    let mut header = vec!["Contig".to_string(), "Position".to_string()];
    header.extend((0..bases.ncols()).map(|g| format!("Haplotype{}", g)));
    writer.write_record(&header)?;
    for (v, row) in bases.outer_iter().enumerate() {
        let mut record: Vec<String> = site_labels(table, v).to_vec();
        record.extend(row.iter().map(|&b| BASES[b].to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Posterior probability of each base for every genome and variant
pub fn write_tau_prob(path: &Path, table: &VariantTable, prob: &Array3<f64>) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    let n_genomes = prob.len_of(Axis(1));
    let mut header = vec!["Contig".to_string(), "Position".to_string()];
    for g in 0..n_genomes {
        header.extend(BASES.iter().map(|b| format!("h{}{}", g, b)));
    }
    writer.write_record(&header)?;
    for (v, site) in prob.outer_iter().enumerate() {
        let mut record: Vec<String> = site_labels(table, v).to_vec();
        record.extend(site.iter().map(|p| format!("{}", p)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Labelled matrix with one row per `row_labels` entry
pub fn write_matrix<T: std::fmt::Display>(
    path: &Path,
    corner: &str,
    row_labels: &[String],
    column_labels: &[String],
    matrix: ArrayView2<T>,
) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    let mut header = vec![corner.to_string()];
    header.extend(column_labels.iter().cloned());
    writer.write_record(&header)?;
    for (label, row) in row_labels.iter().zip(matrix.outer_iter()) {
        let mut record = vec![label.clone()];
        record.extend(row.iter().map(|x| x.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Per-iteration log-likelihood and log-posterior
pub fn write_trace(path: &Path, ll: ArrayView1<f64>, lp: ArrayView1<f64>) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record(["iter", "ll", "lp"])?;
    for (i, (l, p)) in ll.iter().zip(lp.iter()).enumerate() {
        writer.write_record(&[i.to_string(), l.to_string(), p.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn genome_labels(n_genomes: usize) -> Vec<String> {
    (0..n_genomes).map(|g| format!("Haplotype{}", g)).collect()
}

pub fn base_labels() -> Vec<String> {
    BASES.iter().map(|b| b.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn reads_counts_in_sample_major_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.csv");
        fs::write(
            &path,
            "Contig,Position,s1-A,s1-C,s1-G,s1-T,s2-A,s2-C,s2-G,s2-T\n\
             c1,10,5,0,1,0,0,7,0,2\n\
             c1,42,0,0,9,9,3,3,3,3\n",
        )
        .unwrap();
        let table = read_variant_table(&path).unwrap();
        assert_eq!(table.n_variants(), 2);
        assert_eq!(table.n_samples(), 2);
        assert_eq!(table.sample_names, vec!["s1", "s2"]);
        assert_eq!(table.counts[[0, 1, 1]], 7);
        assert_eq!(table.counts[[1, 0, 3]], 9);
        assert_eq!(table.positions[1], "42");
    }

    #[test]
    fn rejects_ragged_or_non_numeric_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "Contig,Position,A,C,G,T\nc1,1,1,2,x,4\n").unwrap();
        assert!(matches!(read_variant_table(&path), Err(HaploError::Parse { line: 2, .. })));

        fs::write(&path, "Contig,Position,A,C,G\nc1,1,1,2,3\n").unwrap();
        assert!(read_variant_table(&path).is_err());
    }

    #[test]
    fn haplotypes_written_can_be_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tau.csv");
        let table = VariantTable {
            contigs: vec!["c".into(), "c".into()],
            positions: vec!["1".into(), "2".into()],
            sample_names: vec!["s".into()],
            counts: Array3::zeros((2, 1, 4)),
        };
        let tau = tau_from_bases(&array![[0usize, 3], [2, 1]]);
        write_tau(&path, &table, &tau).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("c,1,A,T"));
        assert_eq!(read_tau(&path).unwrap(), tau);
    }
}
