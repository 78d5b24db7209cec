//! # Reed–Solomon Forward Error Correction
//!
//! Systematic RS(n, k) over GF(2^8): the k originals of a transmission group
//! are sent unmodified, and up to n-k parity blocks are generated on demand.
//! Any k of the n blocks reconstruct the originals.
//!
//! The generator matrix is a Vandermonde matrix normalized so its top k×k
//! submatrix is the identity; parity block `h` is the product of generator
//! row `k + h` with the original data. Recovery solves the corresponding
//! linear system by Gauss–Jordan elimination over the field.

// ─── GF(256) Arithmetic ─────────────────────────────────────────────────────

/// GF(2^8) with primitive polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11D).
/// Log/antilog tables give O(1) multiply and divide.
mod gf256 {
    /// Multiplication in GF(256).
    #[inline]
    pub fn mul(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        let log_a = LOG_TABLE[a as usize] as u16;
        let log_b = LOG_TABLE[b as usize] as u16;
        EXP_TABLE[((log_a + log_b) % 255) as usize]
    }

    /// Division in GF(256). Panics if b == 0.
    #[inline]
    pub fn div(a: u8, b: u8) -> u8 {
        assert_ne!(b, 0, "division by zero in GF(256)");
        if a == 0 {
            return 0;
        }
        let log_a = LOG_TABLE[a as usize] as u16;
        let log_b = LOG_TABLE[b as usize] as u16;
        EXP_TABLE[((log_a + 255 - log_b) % 255) as usize]
    }

    /// `base` raised to `exp` in GF(256), with 0^0 = 1.
    #[inline]
    pub fn pow(base: u8, exp: usize) -> u8 {
        if exp == 0 {
            return 1;
        }
        if base == 0 {
            return 0;
        }
        let log = LOG_TABLE[base as usize] as usize;
        EXP_TABLE[(log * exp) % 255]
    }

    // Generate both tables together. Primitive polynomial 0x11D, generator 2.
    const fn gen_tables() -> ([u8; 256], [u8; 512]) {
        let mut log = [0u8; 256];
        let mut exp = [0u8; 512];
        let mut x: u16 = 1;
        let mut i = 0usize;
        while i < 255 {
            exp[i] = x as u8;
            exp[i + 255] = x as u8; // duplicate for easy modular lookup
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= 0x11D;
            }
            i += 1;
        }
        // log[0] is unused (0 has no logarithm)
        log[0] = 0;
        (log, exp)
    }

    const TABLES: ([u8; 256], [u8; 512]) = gen_tables();
    const LOG_TABLE: [u8; 256] = TABLES.0;
    const EXP_TABLE: [u8; 512] = TABLES.1;
}

// ─── Codec ──────────────────────────────────────────────────────────────────

/// A systematic RS(n, k) codec bound to fixed parameters.
pub struct ReedSolomon {
    n: usize,
    k: usize,
    /// Parity rows of the systematic generator matrix: (n-k) rows of k
    /// coefficients each.
    parity_rows: Vec<Vec<u8>>,
}

impl ReedSolomon {
    /// Create a codec. `k` originals per group, `n` total blocks.
    ///
    /// Panics unless `2 <= k < n <= 255` — these are configuration values
    /// validated at the transport surface.
    pub fn new(n: usize, k: usize) -> Self {
        assert!(k >= 2, "RS k must be >= 2");
        assert!(k < n, "RS requires k < n");
        assert!(n <= 255, "RS block count limited to field size");

        // Vandermonde rows: row i = [i^0, i^1, ..., i^(k-1)]. Normalizing by
        // the inverse of the top square turns the top k rows into the
        // identity, leaving the parity rows below.
        let vandermonde: Vec<Vec<u8>> = (0..n)
            .map(|i| (0..k).map(|j| gf256::pow(i as u8, j)).collect())
            .collect();
        let top_inverse = invert(&vandermonde[..k]);
        let parity_rows = (k..n)
            .map(|i| mat_mul_row(&vandermonde[i], &top_inverse))
            .collect();

        ReedSolomon { n, k, parity_rows }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Generate parity block `h` over the group's originals.
    ///
    /// All `originals` must share `out`'s length (the caller zero-pads
    /// variable-length groups first). `h` must be below `n - k`.
    pub fn encode_parity(&self, originals: &[&[u8]], h: usize, out: &mut [u8]) {
        assert_eq!(originals.len(), self.k, "parity needs all k originals");
        assert!(h < self.n - self.k, "parity index out of range");
        let row = &self.parity_rows[h];
        out.fill(0);
        for (i, original) in originals.iter().enumerate() {
            debug_assert_eq!(original.len(), out.len());
            let coeff = row[i];
            if coeff == 0 {
                continue;
            }
            for (o, &b) in out.iter_mut().zip(original.iter()) {
                *o ^= gf256::mul(coeff, b);
            }
        }
    }

    /// Reconstruct missing originals in place.
    ///
    /// `originals[i]` is `Some` for received blocks, `None` for erasures;
    /// `parity` holds `(h, block)` pairs. Returns `false` when fewer than k
    /// blocks are available in total. All blocks must have length
    /// `block_len`.
    pub fn reconstruct(
        &self,
        originals: &mut [Option<Vec<u8>>],
        parity: &[(usize, &[u8])],
        block_len: usize,
    ) -> bool {
        assert_eq!(originals.len(), self.k);
        let present: Vec<usize> = (0..self.k).filter(|&i| originals[i].is_some()).collect();
        let missing: Vec<usize> = (0..self.k).filter(|&i| originals[i].is_none()).collect();
        if missing.is_empty() {
            return true;
        }
        if present.len() + parity.len() < self.k {
            return false;
        }

        // Build the k×k system from the rows we hold: unit rows for received
        // originals, generator parity rows for the parity blocks used.
        let mut rows: Vec<Vec<u8>> = Vec::with_capacity(self.k);
        let mut data: Vec<Vec<u8>> = Vec::with_capacity(self.k);
        for &i in &present {
            let mut row = vec![0u8; self.k];
            row[i] = 1;
            rows.push(row);
            data.push(originals[i].as_deref().expect("present original").to_vec());
        }
        for &(h, block) in parity.iter().take(self.k - present.len()) {
            assert!(h < self.n - self.k, "parity index out of range");
            rows.push(self.parity_rows[h].clone());
            data.push(block.to_vec());
        }

        let inverse = invert(&rows);
        for &m in &missing {
            let mut block = vec![0u8; block_len];
            for (j, source) in data.iter().enumerate() {
                let coeff = inverse[m][j];
                if coeff == 0 {
                    continue;
                }
                for (o, &b) in block.iter_mut().zip(source.iter()) {
                    *o ^= gf256::mul(coeff, b);
                }
            }
            originals[m] = Some(block);
        }
        true
    }
}

/// Multiply a row vector by a square matrix: `(row × m)`.
fn mat_mul_row(row: &[u8], m: &[Vec<u8>]) -> Vec<u8> {
    let k = row.len();
    (0..k)
        .map(|j| {
            let mut acc = 0u8;
            for (i, &r) in row.iter().enumerate() {
                acc ^= gf256::mul(r, m[i][j]);
            }
            acc
        })
        .collect()
}

/// Invert a square matrix over GF(256) by Gauss–Jordan elimination.
///
/// Panics on a singular matrix; Vandermonde submatrices with distinct
/// evaluation points are always invertible.
fn invert(matrix: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let k = matrix.len();
    let mut work: Vec<Vec<u8>> = matrix.to_vec();
    let mut inverse: Vec<Vec<u8>> = (0..k)
        .map(|i| {
            let mut row = vec![0u8; k];
            row[i] = 1;
            row
        })
        .collect();

    for col in 0..k {
        // Find a pivot.
        let pivot = (col..k)
            .find(|&r| work[r][col] != 0)
            .expect("singular matrix");
        work.swap(col, pivot);
        inverse.swap(col, pivot);

        // Scale the pivot row to 1.
        let p = work[col][col];
        if p != 1 {
            for j in 0..k {
                work[col][j] = gf256::div(work[col][j], p);
                inverse[col][j] = gf256::div(inverse[col][j], p);
            }
        }

        // Eliminate the column from every other row.
        for r in 0..k {
            if r == col || work[r][col] == 0 {
                continue;
            }
            let factor = work[r][col];
            for j in 0..k {
                let w = gf256::mul(factor, work[col][j]);
                work[r][j] ^= w;
                let v = gf256::mul(factor, inverse[col][j]);
                inverse[r][j] ^= v;
            }
        }
    }
    inverse
}

// ─── Variable-Length Group Helpers ──────────────────────────────────────────

/// Pad a TSDU to the group block size with a trailing 2-byte big-endian
/// original length, for OPT_VAR_PKTLEN groups. `block_len` includes the
/// trailer.
pub fn pad_var_pktlen(tsdu: &[u8], block_len: usize) -> Vec<u8> {
    debug_assert!(tsdu.len() + 2 <= block_len);
    let mut padded = vec![0u8; block_len];
    padded[..tsdu.len()].copy_from_slice(tsdu);
    padded[block_len - 2..].copy_from_slice(&(tsdu.len() as u16).to_be_bytes());
    padded
}

/// Recover the original TSDU length from a reconstructed var-pktlen block.
/// Returns `None` when the trailer is inconsistent with the block size.
pub fn unpad_var_pktlen(block: &[u8]) -> Option<usize> {
    if block.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([block[block.len() - 2], block[block.len() - 1]]) as usize;
    if len + 2 > block.len() {
        return None;
    }
    Some(len)
}
