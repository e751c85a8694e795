// compare two haplotype sets by single-nucleotide differences
use std::path::Path;

use log::info;

use crate::error::Result;
use crate::io;
use crate::postprocess::comp_snd;

pub fn start(first: &Path, second: &Path, output: &Path) -> Result<()> {
    let tau1 = io::read_tau(first)?;
    let tau2 = io::read_tau(second)?;
    let snd = comp_snd(&tau1, &tau2)?;
    info!(
        "Compared {} genomes against {} genomes over {} variants",
        snd.nrows(),
        snd.ncols(),
        tau1.len_of(ndarray::Axis(0))
    );
    let rows = io::genome_labels(snd.nrows());
    let columns = io::genome_labels(snd.ncols());
    io::write_matrix(output, "Genome", &rows, &columns, snd.view())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn writes_difference_matrix() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.csv");
        let second = dir.path().join("b.csv");
        let output = dir.path().join("snd.csv");
        fs::write(&first, "Contig,Position,H0,H1\nc,1,A,C\nc,2,G,G\nc,3,T,A\n").unwrap();
        fs::write(&second, "Contig,Position,H0\nc,1,A\nc,2,G\nc,3,A\n").unwrap();
        start(&first, &second, &output).unwrap();
        let text = fs::read_to_string(&output).unwrap();
        assert_eq!(text, "Genome,Haplotype0\nHaplotype0,1\nHaplotype1,1\n");
    }
}
