/// A salt or hydration qualifier removed from substance names by exact substring match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualifierTerm {
    pub pattern: &'static str,
    pub replacement: &'static str,
}

const fn strip(pattern: &'static str) -> QualifierTerm {
    QualifierTerm {
        pattern,
        replacement: "",
    }
}

/// Qualifier terms in application order.
///
/// Ordering invariant: a term never appears as a substring of a term listed after
/// it, so "CLORIDRATO DE" is consumed whole before the bare "CLORIDRATO" rule can
/// leave a dangling "DE" behind.
pub const QUALIFIER_TERMS: &[QualifierTerm] = &[
    strip("CLORIDRATO DE"),
    strip("BROMIDRATO DE"),
    strip("FOSFATO DE"),
    strip("ACETATO DE"),
    strip("DECANOATO DE"),
    strip("NITRATO DE"),
    strip("HEMISSULFATO DE"),
    strip("SUCCINATO DE"),
    strip("MALEATO DE"),
    strip("MESILATO DE"),
    strip("VALERATO DE"),
    strip("ESILATO DE"),
    strip("CIPIONATO DE"),
    strip("TRI-HIDRATADO"),
    strip("TRIHIDRATADA"),
    strip("MONOIDRATADO"),
    strip("DI-HIDRATADO"),
    strip("ANIDRO"),
    strip("OXALATO DE"),
    strip("SULFATO DE"),
    strip("CLORIDRATO"),
    strip("BROMIDRATO"),
    strip("FOSFATO"),
    strip("ACETATO"),
    strip("DECANOATO"),
    strip("NITRATO"),
    strip("SESQUI-HIDRATADO"),
    strip("UNDECILATO DE"),
    strip("DIPROPIONATO DE BETAMETASONA"),
    strip("CLORETO DE BENZALCONIO"),
];

/// Pairs `(earlier, later)` that break the ordering invariant
pub fn ordering_violations(terms: &[QualifierTerm]) -> Vec<(&'static str, &'static str)> {
    let mut violations = Vec::new();
    for (i, earlier) in terms.iter().enumerate() {
        for later in &terms[i + 1..] {
            if later.pattern.contains(earlier.pattern) {
                violations.push((earlier.pattern, later.pattern));
            }
        }
    }
    violations
}
