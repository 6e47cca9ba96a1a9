// ========================================================================================
//                              Genotype canonicalization
// ========================================================================================

use crate::types::split_alleles;

/// Normalizes a genotype string for counting.
///
/// With `ignore_phase` unset the input is returned untouched. Otherwise a
/// heterozygous diploid genotype is rewritten with its alleles sorted and joined
/// by `/`, so `T|A` and `A/T` both become `A/T`. Homozygous, haploid and
/// polyploid genotypes are left as they are.
pub fn canonicalize(genotype: &str, ignore_phase: bool) -> String {
    if !ignore_phase {
        return genotype.to_string();
    }

    let mut alleles = split_alleles(genotype);
    match (alleles.next(), alleles.next(), alleles.next()) {
        (Some(first), Some(second), None) if first != second => {
            if first <= second {
                format!("{first}/{second}")
            } else {
                format!("{second}/{first}")
            }
        }
        _ => genotype.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_is_kept_unless_ignored() {
        assert_eq!(canonicalize("T|A", false), "T|A");
        assert_eq!(canonicalize("T|A", true), "A/T");
        assert_eq!(canonicalize("A|T", true), canonicalize("T|A", true));
        assert_eq!(canonicalize("A/T", true), "A/T");
    }

    #[test]
    fn homozygous_haploid_and_polyploid_are_untouched() {
        assert_eq!(canonicalize("G|G", true), "G|G");
        assert_eq!(canonicalize("C", true), "C");
        assert_eq!(canonicalize("T|A|C", true), "T|A|C");
        assert_eq!(canonicalize("", true), "");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for raw in ["T|A", "A/T", "G|G", "C", "T|A|C", "AT|A", "./.", "A|AT"] {
            for ignore_phase in [false, true] {
                let once = canonicalize(raw, ignore_phase);
                assert_eq!(canonicalize(&once, ignore_phase), once, "input {raw}");
            }
        }
    }
}
