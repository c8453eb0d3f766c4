//! Minimum-edit-distance alignment between normalized word sequences.
//!
//! Tie-break when several alignments reach the same cost: prefer
//! match > substitution > insertion > deletion while reconstructing the
//! operation path. The total edit distance is unaffected, but the S/D/I
//! decomposition is not, so the rule is fixed here and covered by tests.

/// Per-utterance alignment outcome. `ref_len` is this utterance's
/// contribution to the corpus WER denominator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignmentCounts {
    pub substitutions: usize,
    pub deletions: usize,
    pub insertions: usize,
    pub matches: usize,
    pub ref_len: usize,
}

impl AlignmentCounts {
    pub fn errors(&self) -> usize {
        self.substitutions + self.deletions + self.insertions
    }

    pub fn accumulate(&mut self, other: &AlignmentCounts) {
        self.substitutions += other.substitutions;
        self.deletions += other.deletions;
        self.insertions += other.insertions;
        self.matches += other.matches;
        self.ref_len += other.ref_len;
    }
}

// Backpointer values; Diag covers both match and substitution.
const STEP_DIAG: u8 = 0;
const STEP_INSERT: u8 = 1;
const STEP_DELETE: u8 = 2;

pub fn score_words<S: AsRef<str>>(ref_words: &[S], hyp_words: &[S]) -> AlignmentCounts {
    let n = ref_words.len();
    let m = hyp_words.len();

    if n == 0 {
        return AlignmentCounts {
            insertions: m,
            ..AlignmentCounts::default()
        };
    }
    if m == 0 {
        return AlignmentCounts {
            deletions: n,
            ref_len: n,
            ..AlignmentCounts::default()
        };
    }

    let width = m + 1;
    let mut back = vec![STEP_DIAG; (n + 1) * width];
    let mut prev_row = vec![0_usize; width];
    let mut row = vec![0_usize; width];

    for (j, cell) in prev_row.iter_mut().enumerate() {
        *cell = j;
    }
    for j in 1..=m {
        back[j] = STEP_INSERT;
    }

    for i in 1..=n {
        row[0] = i;
        back[i * width] = STEP_DELETE;
        let ref_word = ref_words[i - 1].as_ref();

        for j in 1..=m {
            let hyp_word = hyp_words[j - 1].as_ref();

            if ref_word == hyp_word {
                row[j] = prev_row[j - 1];
                back[i * width + j] = STEP_DIAG;
                continue;
            }

            let substitution = prev_row[j - 1] + 1;
            let insertion = row[j - 1] + 1;
            let deletion = prev_row[j] + 1;

            // <= keeps the preference order on cost ties.
            let (cost, step) = if substitution <= insertion && substitution <= deletion {
                (substitution, STEP_DIAG)
            } else if insertion <= deletion {
                (insertion, STEP_INSERT)
            } else {
                (deletion, STEP_DELETE)
            };
            row[j] = cost;
            back[i * width + j] = step;
        }

        std::mem::swap(&mut prev_row, &mut row);
    }

    let mut counts = AlignmentCounts {
        ref_len: n,
        ..AlignmentCounts::default()
    };
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        match back[i * width + j] {
            STEP_DIAG => {
                if ref_words[i - 1].as_ref() == hyp_words[j - 1].as_ref() {
                    counts.matches += 1;
                } else {
                    counts.substitutions += 1;
                }
                i -= 1;
                j -= 1;
            }
            STEP_INSERT => {
                counts.insertions += 1;
                j -= 1;
            }
            _ => {
                counts.deletions += 1;
                i -= 1;
            }
        }
    }

    counts
}
