//! Colored output formatting for the tosalower CLI

use colored::*;
use std::collections::BTreeMap;
use tosalower_compiler::Pipeline;
use tosalower_ir::TosaProgram;

pub fn print_success(message: &str) {
    eprintln!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn print_header(title: &str) {
    println!("\n{}", title.cyan().bold());
    println!("{}", "=".repeat(title.len()).cyan());
}

pub fn format_program_stats(program: &TosaProgram) -> String {
    format!(
        "Program: {} tensors, {} operators, {} inputs, {} outputs",
        program.tensors.len().to_string().green(),
        program.operators.len().to_string().cyan(),
        program.inputs.len().to_string().yellow(),
        program.outputs.len().to_string().magenta()
    )
}

/// Operator counts, sorted by operator name.
pub fn operator_histogram(program: &TosaProgram) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for op in &program.operators {
        *counts.entry(format!("{:?}", op.op)).or_insert(0) += 1;
    }
    counts
}

pub fn print_compilation_success(program: &TosaProgram) {
    print_success(&format!("Lowered for {}", program.spec));
    eprintln!("  {}", format_program_stats(program));
    for (op, count) in operator_histogram(program) {
        eprintln!("    {op}: {count}");
    }
}

pub fn print_pipeline(pipeline: &Pipeline) {
    print_header(&format!("{} pipeline for {}", pipeline.name(), pipeline.spec()));
    for (i, name) in pipeline.pass_names().iter().enumerate() {
        println!("{:>3}. {}", (i + 1).to_string().dimmed(), name);
    }
}

pub fn enable_colors(enabled: bool) {
    colored::control::set_override(enabled);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tosalower_ir::tosa::TosaOperator;
    use tosalower_ir::{TosaOp, TosaSpecification};

    fn op(op: TosaOp) -> TosaOperator {
        TosaOperator {
            op,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attribute: Default::default(),
        }
    }

    #[test]
    fn test_operator_histogram() {
        let spec: TosaSpecification = "TOSA-1.0+FP".parse().unwrap();
        let program = TosaProgram {
            spec,
            tensors: Vec::new(),
            operators: vec![op(TosaOp::Transpose), op(TosaOp::Conv2d), op(TosaOp::Transpose)],
            inputs: Vec::new(),
            outputs: Vec::new(),
        };
        let counts = operator_histogram(&program);
        assert_eq!(counts.get("Transpose"), Some(&2));
        assert_eq!(counts.get("Conv2d"), Some(&1));
        assert_eq!(counts.len(), 2);

        enable_colors(false);
        assert_eq!(
            format_program_stats(&program),
            "Program: 0 tensors, 3 operators, 0 inputs, 0 outputs"
        );
    }
}
