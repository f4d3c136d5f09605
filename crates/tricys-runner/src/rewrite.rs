use crate::error::{JobError, JobResult};
use crate::model::{apply_splices, line_start, ClassDef, ModelFile, Port, PortRef, Splice};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

pub const INTERCEPTED_SUFFIX: &str = "_Intercepted";
pub const INTERCEPTOR_SUFFIX: &str = "_Interceptor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewriteMode {
    /// Wrap the target's outputs in a generated selector model; original files stay untouched.
    #[default]
    Interceptor,
    /// Rewrite the target sub-model in place so its outputs come from the table.
    Replacement,
}

impl FromStr for RewriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interceptor" => Ok(RewriteMode::Interceptor),
            "replacement" => Ok(RewriteMode::Replacement),
            other => Err(format!(
                "unknown co_simulation.mode '{}' (expected interceptor or replacement)",
                other
            )),
        }
    }
}

impl fmt::Display for RewriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteMode::Interceptor => f.write_str("interceptor"),
            RewriteMode::Replacement => f.write_str("replacement"),
        }
    }
}

/// Column selection for one port; `columns[0]` is the time column and
/// `columns[i]` feeds element `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortOverride {
    pub port: String,
    pub columns: Vec<u32>,
}

/// One sub-model instance whose outputs are driven from a table file.
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteTarget {
    pub submodel: String,
    pub instance: String,
    pub csv_path: PathBuf,
    pub overrides: Vec<PortOverride>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PackageLayout {
    /// Every class lives in one `.mo` file.
    SingleFile { file: PathBuf },
    /// `package.mo` plus one file per class.
    MultiFile { dir: PathBuf },
}

impl PackageLayout {
    pub fn detect(package_path: &Path) -> Self {
        if package_path.is_dir() {
            return PackageLayout::MultiFile {
                dir: package_path.to_path_buf(),
            };
        }
        if package_path.file_name().and_then(|n| n.to_str()) == Some("package.mo") {
            return PackageLayout::MultiFile {
                dir: package_path
                    .parent()
                    .unwrap_or(Path::new("."))
                    .to_path_buf(),
            };
        }
        PackageLayout::SingleFile {
            file: package_path.to_path_buf(),
        }
    }

    fn package_name(&self) -> JobResult<String> {
        let entry = match self {
            PackageLayout::SingleFile { file } => file.clone(),
            PackageLayout::MultiFile { dir } => dir.join("package.mo"),
        };
        if entry.is_file() {
            let file = load(&entry)?;
            if let Some(top) = file.classes.first() {
                return Ok(top.name.clone());
            }
        }
        match self {
            PackageLayout::MultiFile { dir } => dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| invalid(format!("cannot name package at {}", dir.display()))),
            PackageLayout::SingleFile { file } => Err(invalid(format!("{} declares no package", file.display()))),
        }
    }

    /// File holding `class_path`, and the path of the class inside that file.
    fn locate(&self, package: &str, class_path: &str) -> (PathBuf, String) {
        let rel: Vec<&str> = class_path
            .split('.')
            .skip_while(|s| *s == package)
            .collect();
        match self {
            PackageLayout::SingleFile { file } => (file.clone(), format!("{}.{}", package, rel.join("."))),
            PackageLayout::MultiFile { dir } => {
                let mut path = dir.clone();
                for seg in &rel[..rel.len().saturating_sub(1)] {
                    path.push(seg);
                }
                let short = rel.last().copied().unwrap_or(class_path);
                path.push(format!("{}.mo", short));
                (path, short.to_string())
            }
        }
    }
}

fn invalid(message: impl Into<String>) -> JobError {
    JobError::RewriteTargetInvalid(message.into())
}

fn short_name(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

fn load(path: &Path) -> JobResult<ModelFile> {
    let source = fs::read_to_string(path)
        .map_err(|e| invalid(format!("cannot read {}: {}", path.display(), e)))?;
    ModelFile::parse(&source).map_err(|e| invalid(format!("{}: {}", path.display(), e)))
}

fn find_class<'f>(file: &'f ModelFile, class_path: &str, origin: &Path) -> JobResult<&'f ClassDef> {
    file.class_path(class_path)
        .or_else(|| file.find(short_name(class_path)))
        .ok_or_else(|| invalid(format!("class '{}' not found in {}", class_path, origin.display())))
}

/// Ports declared on `submodel` within the package at `package_path`.
pub fn submodel_ports(package_path: &Path, submodel: &str) -> JobResult<Vec<Port>> {
    let layout = PackageLayout::detect(package_path);
    let package = layout.package_name()?;
    let (file_path, class_path) = layout.locate(&package, submodel);
    let file = load(&file_path)?;
    find_class(&file, &class_path, &file_path)?
        .ports()
        .map_err(invalid)
}

/// Output ports of `class` paired with their override, checked for shape.
fn plan_ports(class: &ClassDef, target: &RewriteTarget, all_required: bool) -> JobResult<Vec<(Port, Vec<u32>)>> {
    let outputs = class.output_ports().map_err(invalid)?;
    if outputs.is_empty() {
        return Err(invalid(format!(
            "sub-model '{}' (instance '{}') has no output ports",
            target.submodel, target.instance
        )));
    }
    if target.overrides.is_empty() {
        return Err(invalid(format!("no ports to override on instance '{}'", target.instance)));
    }
    let mut planned = Vec::new();
    for ov in &target.overrides {
        let port = outputs
            .iter()
            .find(|p| p.name == ov.port)
            .ok_or_else(|| invalid(format!("'{}' is not an output port of '{}'", ov.port, target.submodel)))?;
        if ov.columns.len() != port.dim + 1 {
            return Err(JobError::HandlerContractViolation(format!(
                "column spec for port '{}' has {} entries, expected {} (time plus {} elements)",
                ov.port,
                ov.columns.len(),
                port.dim + 1,
                port.dim
            )));
        }
        planned.push((port.clone(), ov.columns.clone()));
    }
    if all_required {
        let missing: Vec<&str> = outputs
            .iter()
            .filter(|p| !target.overrides.iter().any(|o| o.port == p.name))
            .map(|p| p.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(invalid(format!(
                "replacement of '{}' needs a column spec for every output port; missing: {}",
                target.submodel,
                missing.join(", ")
            )));
        }
    }
    Ok(planned)
}

fn modelica_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").replace('"', "\\\"")
}

fn column_literal(columns: &[u32]) -> String {
    let parts: Vec<String> = columns.iter().map(u32::to_string).collect();
    format!("{{{}}}", parts.join(","))
}

fn table_declaration(port: &Port, annotate: bool) -> String {
    format!(
        "  Modelica.Blocks.Sources.CombiTimeTable table_{p}(\n    tableName=\"csv_data_{p}\",\n    fileName=fileName,\n    columns=columns_{p}[2:{last}],\n    tableOnFile=true\n  ){ann};\n",
        p = port.name,
        last = port.dim + 1,
        ann = if annotate { " annotation(HideResult=true)" } else { "" }
    )
}

fn dims_suffix(port: &Port) -> String {
    if port.array {
        format!("[{}]", port.dim)
    } else {
        String::new()
    }
}

/// Selector model for one sub-model: per element, column `1` passes the
/// physical signal through and any other column reads the table.
fn render_interceptor(name: &str, source: &str, within: Option<&str>, csv: &Path, ports: &[(Port, Vec<u32>)]) -> String {
    let mut out = String::new();
    if let Some(pkg) = within {
        out.push_str(&format!("within {};\n\n", pkg));
    }
    out.push_str(&format!("model {}\n", name));
    for (port, _) in ports {
        out.push_str(&format!(
            "  Modelica.Blocks.Interfaces.RealInput physical_{}{} \"Received from {}\";\n",
            port.name,
            dims_suffix(port),
            source
        ));
    }
    for (port, _) in ports {
        out.push_str(&format!(
            "  Modelica.Blocks.Interfaces.RealOutput final_{}{} \"Final output\";\n",
            port.name,
            dims_suffix(port)
        ));
    }
    out.push_str("\nprotected\n");
    out.push_str(&format!(
        "  parameter String fileName = \"{}\" \"Path to the CSV file\";\n",
        modelica_string(csv)
    ));
    for (port, columns) in ports {
        out.push_str(&format!(
            "  parameter Integer columns_{p}[{n}] = {c} \"Column mapping for {p}: {{time, y1, y2, ...}}. Use 1 for pass-through\";\n",
            p = port.name,
            n = port.dim + 1,
            c = column_literal(columns)
        ));
    }
    for (port, _) in ports {
        out.push_str(&table_declaration(port, true));
    }
    out.push_str("\nequation\n");
    for (port, _) in ports {
        let p = &port.name;
        if port.array {
            out.push_str(&format!(
                "  for i in 1:{n} loop\n    final_{p}[i] = if columns_{p}[i+1] <> 1 then table_{p}.y[i] else physical_{p}[i];\n  end for;\n",
                n = port.dim,
                p = p
            ));
        } else {
            out.push_str(&format!(
                "  final_{p} = if columns_{p}[2] <> 1 then table_{p}.y[1] else physical_{p};\n",
                p = p
            ));
        }
    }
    out.push_str(&format!(
        "  annotation(\n    Icon(graphics = {{\n      Rectangle(fillColor = {{255, 255, 180}}, extent = {{{{-100, 100}}, {{100, -100}}}}),\n      Text(extent = {{{{-80, 40}}, {{80, -40}}}}, textString = \"{}\\nInterceptor\")\n    }}));\nend {};\n",
        source, name
    ));
    out
}

fn indent_lines(text: &str, indent: &str) -> String {
    text.lines()
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                format!("{}{}", indent, l)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whitespace before `offset` on its line, or `None` when other text precedes it.
fn leading_indent(source: &str, offset: usize) -> Option<&str> {
    let prefix = &source[line_start(source, offset)..offset];
    prefix.chars().all(char::is_whitespace).then_some(prefix)
}

/// Text insertion before the keyword at `offset`: at its line start when the
/// keyword opens the line, otherwise right before it on a fresh line.
fn insert_before_line(source: &str, offset: usize, text: &str) -> Splice {
    match leading_indent(source, offset) {
        Some(_) => Splice::insert(line_start(source, offset), text),
        None => Splice::insert(offset, format!("\n{}", text)),
    }
}

struct InterceptPlan {
    instance: String,
    interceptor: String,
    ports: Vec<(Port, Vec<u32>)>,
}

/// Splices that route the planned ports of `host` through their interceptor
/// instances and rename the class to `new_name`.
fn intercept_host(file: &ModelFile, host: &ClassDef, package: &str, plans: &[InterceptPlan], new_name: &str) -> JobResult<String> {
    let src = file.source.as_str();
    let mut splices = Vec::new();
    let member_indent = host
        .components
        .first()
        .and_then(|c| leading_indent(src, c.span.start))
        .filter(|s| !s.is_empty())
        .unwrap_or("  ")
        .to_string();

    let mut declarations = String::new();
    for plan in plans {
        if host.component(&plan.instance).is_none() {
            return Err(invalid(format!(
                "instance '{}' is not declared in '{}'",
                plan.instance, host.name
            )));
        }
        let wrapper = format!("{}_interceptor", plan.instance);
        declarations.push_str(&format!(
            "{}{}.{} {};\n",
            member_indent, package, plan.interceptor, wrapper
        ));

        let mut physical_linked: HashSet<String> = HashSet::new();
        for (port, _) in &plan.ports {
            let touching = host.connections_touching(&plan.instance, &port.name);
            if touching.is_empty() {
                return Err(invalid(format!(
                    "port '{}.{}' is not connected in '{}'",
                    plan.instance, port.name, host.name
                )));
            }
            for conn in touching {
                let (target, other): (&PortRef, &PortRef) = if conn.from.refers_to(&plan.instance, &port.name) {
                    (&conn.from, &conn.to)
                } else {
                    (&conn.to, &conn.from)
                };
                let indent = leading_indent(src, conn.span.start).unwrap_or("");
                let mut text = String::new();
                if physical_linked.insert(target.to_string()) {
                    text.push_str(&format!(
                        "connect({}, {});\n{}",
                        target,
                        target.retarget(&wrapper, &format!("physical_{}", port.name)),
                        indent
                    ));
                }
                text.push_str(&format!(
                    "connect({}, {});",
                    target.retarget(&wrapper, &format!("final_{}", port.name)),
                    other
                ));
                splices.push(Splice::replace(conn.span.clone(), text));
            }
        }
    }

    let anchor = host.equation_start.unwrap_or(host.end_start);
    splices.push(insert_before_line(src, anchor, &declarations));
    splices.push(Splice::replace(host.name_span.clone(), new_name));
    splices.push(Splice::replace(host.end_name_span.clone(), new_name));
    apply_splices(src, host.span.clone(), splices).map_err(invalid)
}

/// Result of an interceptor rewrite: what the second-stage simulation loads.
#[derive(Debug, Clone, PartialEq)]
pub struct Intercepted {
    pub package_path: PathBuf,
    pub model_name: String,
    pub written: Vec<PathBuf>,
}

/// `<Sub>_Interceptor`, or `<Sub>_<instance>_Interceptor` when several
/// targets share the sub-model so each gets its own table.
fn interceptor_name(submodel: &str, instance: &str, targets: &[RewriteTarget]) -> String {
    let sharing = targets
        .iter()
        .filter(|t| short_name(&t.submodel) == submodel)
        .count();
    if sharing > 1 {
        format!("{}_{}{}", submodel, instance, INTERCEPTOR_SUFFIX)
    } else {
        format!("{}{}", submodel, INTERCEPTOR_SUFFIX)
    }
}

/// Generates one interceptor per target and a copy of the host model with
/// the targets' output connections routed through them. Only new files are
/// written; the host model and the sub-models are left as they are.
pub fn build_interceptor(package_path: &Path, model_name: &str, targets: &[RewriteTarget]) -> JobResult<Intercepted> {
    let layout = PackageLayout::detect(package_path);
    let package = layout.package_name()?;
    let host_short = short_name(model_name);
    let new_host = format!("{}{}", host_short, INTERCEPTED_SUFFIX);
    let (host_path, host_class_path) = layout.locate(&package, model_name);
    let host_file = load(&host_path)?;
    let host = find_class(&host_file, &host_class_path, &host_path)?;

    let mut instances = HashSet::new();
    for target in targets {
        if !instances.insert(target.instance.as_str()) {
            return Err(invalid(format!("instance '{}' is targeted more than once", target.instance)));
        }
    }

    let mut plans = Vec::new();
    let mut interceptors = Vec::new();
    for target in targets {
        let (sub_path, sub_class_path) = layout.locate(&package, &target.submodel);
        let sub_file = if sub_path == host_path {
            host_file.clone()
        } else {
            load(&sub_path)?
        };
        let sub = find_class(&sub_file, &sub_class_path, &sub_path)?;
        let ports = plan_ports(sub, target, false)?;
        let interceptor = interceptor_name(&sub.name, &target.instance, targets);
        interceptors.push((interceptor.clone(), sub.name.clone(), target.csv_path.clone(), ports.clone()));
        plans.push(InterceptPlan {
            instance: target.instance.clone(),
            interceptor,
            ports,
        });
    }

    let host_text = intercept_host(&host_file, host, &package, &plans, &new_host)?;
    let mut written = Vec::new();
    let stage2_package = match &layout {
        PackageLayout::SingleFile { file } => {
            let pkg_class = host_file
                .class_path(&package)
                .ok_or_else(|| invalid(format!("package '{}' not found in {}", package, file.display())))?;
            let host_indent = leading_indent(&host_file.source, host.span.start).unwrap_or("  ");
            let mut block = String::new();
            for (name, source, csv, ports) in &interceptors {
                block.push_str(&indent_lines(&render_interceptor(name, source, None, csv, ports), "  "));
                block.push_str("\n\n");
            }
            block.push_str(host_indent);
            block.push_str(&host_text);
            block.push_str("\n\n");
            let text = apply_splices(
                &host_file.source,
                0..host_file.source.len(),
                vec![insert_before_line(&host_file.source, pkg_class.end_start, &block)],
            )
            .map_err(invalid)?;
            let stem = file
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| package.clone());
            let out = file.with_file_name(format!("{}{}.mo", stem, INTERCEPTED_SUFFIX));
            fs::write(&out, text)?;
            written.push(out.clone());
            out
        }
        PackageLayout::MultiFile { dir } => {
            for (name, source, csv, ports) in &interceptors {
                let out = dir.join(format!("{}.mo", name));
                fs::write(&out, render_interceptor(name, source, Some(package.as_str()), csv, ports))?;
                written.push(out);
            }
            // the host file is a single class, so keep its header text (within clause) as is
            let mut text = String::new();
            text.push_str(&host_file.source[..host.span.start]);
            text.push_str(&host_text);
            text.push_str(&host_file.source[host.span.end..]);
            let out = host_path.with_file_name(format!("{}.mo", new_host));
            fs::write(&out, text)?;
            written.push(out);
            dir.join("package.mo")
        }
    };

    let stage2_model = match model_name.rsplit_once('.') {
        Some((prefix, _)) => format!("{}.{}", prefix, new_host),
        None => format!("{}.{}", package, new_host),
    };
    info!(
        model = %stage2_model,
        interceptors = interceptors.len(),
        package = %stage2_package.display(),
        "interceptor rewrite complete"
    );
    Ok(Intercepted {
        package_path: stage2_package,
        model_name: stage2_model,
        written,
    })
}

pub fn backup_path(file: &Path) -> PathBuf {
    file.with_extension("bak")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Replaced {
    pub file: PathBuf,
    pub backup: PathBuf,
}

/// New body for `class`: its port signature (and the parameters sizing it)
/// verbatim, one table reader per output port, and nothing else.
fn render_replacement(file: &ModelFile, class: &ClassDef, csv: &Path, ports: &[(Port, Vec<u32>)]) -> JobResult<String> {
    let src = file.source.as_str();
    let mut kept: Vec<std::ops::Range<usize>> = class
        .dimension_parameters()
        .into_iter()
        .map(|c| c.span.clone())
        .collect();
    kept.extend(class.ports().map_err(invalid)?.into_iter().map(|p| p.span));
    kept.sort_by_key(|r| r.start);
    kept.dedup();

    let mut out = format!("{} {}\n", class.kind, class.name);
    for span in &kept {
        let indent = leading_indent(src, span.start).unwrap_or("");
        if indent.len() >= 2 {
            out.push_str("  ");
        } else {
            out.push_str(indent);
            out.push_str(&"  "[indent.len()..]);
        }
        out.push_str(&src[span.clone()]);
        out.push('\n');
    }
    out.push_str("\nprotected\n");
    out.push_str(&format!(
        "  parameter String fileName = \"{}\" \"Path to the CSV file\";\n",
        modelica_string(csv)
    ));
    for (port, _) in ports {
        out.push_str(&table_declaration(port, false));
    }
    for (port, columns) in ports {
        out.push_str(&format!(
            "  parameter Integer columns_{}[{}] = {};\n",
            port.name,
            port.dim + 1,
            column_literal(columns)
        ));
    }
    out.push_str("\nequation\n");
    for (port, _) in ports {
        let p = &port.name;
        if port.array {
            out.push_str(&format!(
                "  for i in 1:{n} loop\n    {p}[i] = if columns_{p}[i+1] == 1 then 0.0 else table_{p}.y[i];\n  end for;\n",
                n = port.dim,
                p = p
            ));
        } else {
            out.push_str(&format!(
                "  {p} = if columns_{p}[2] == 1 then 0.0 else table_{p}.y[1];\n",
                p = p
            ));
        }
    }
    for ann in &class.annotations {
        out.push_str("  ");
        out.push_str(&src[ann.clone()]);
        out.push('\n');
    }
    out.push_str(&format!("end {};", class.name));
    Ok(out)
}

/// Rewrites the target sub-model so its outputs read from the table file.
///
/// The pre-image is saved next to the file as `.bak` the first time. When a
/// backup already exists the class is first restored from it, so repeated
/// application always starts from the original text.
pub fn apply_replacement(package_path: &Path, target: &RewriteTarget) -> JobResult<Replaced> {
    let layout = PackageLayout::detect(package_path);
    let package = layout.package_name()?;
    let (file_path, class_path) = layout.locate(&package, &target.submodel);
    if !file_path.is_file() {
        return Err(invalid(format!(
            "model file for '{}' not found at {}",
            target.submodel,
            file_path.display()
        )));
    }
    let backup = backup_path(&file_path);
    if !backup.exists() {
        fs::copy(&file_path, &backup)?;
    }

    let pristine = load(&backup)?;
    let original_class = find_class(&pristine, &class_path, &backup)?;
    let ports = plan_ports(original_class, target, true)?;
    let new_class = render_replacement(&pristine, original_class, &target.csv_path, &ports)?;
    let new_class = match leading_indent(&pristine.source, original_class.span.start) {
        Some(indent) if !indent.is_empty() => {
            let mut lines = new_class.lines();
            let first = lines.next().unwrap_or_default().to_string();
            let rest: Vec<String> = lines
                .map(|l| if l.is_empty() { String::new() } else { format!("{}{}", indent, l) })
                .collect();
            std::iter::once(first).chain(rest).collect::<Vec<_>>().join("\n")
        }
        _ => new_class,
    };

    let current = load(&file_path)?;
    let current_class = find_class(&current, &class_path, &file_path)?;
    let text = apply_splices(
        &current.source,
        0..current.source.len(),
        vec![Splice::replace(current_class.span.clone(), new_class)],
    )
    .map_err(invalid)?;
    fs::write(&file_path, text)?;
    info!(
        submodel = %target.submodel,
        file = %file_path.display(),
        ports = ports.len(),
        "sub-model replaced with table data"
    );
    Ok(Replaced {
        file: file_path,
        backup,
    })
}

/// Puts the `.bak` pre-image back and removes the backup. Returns `false`
/// when there is nothing to restore.
pub fn restore_backup(file: &Path) -> JobResult<bool> {
    let backup = backup_path(file);
    if !backup.is_file() {
        return Ok(false);
    }
    fs::copy(&backup, file)?;
    fs::remove_file(&backup)?;
    info!(file = %file.display(), "restored from backup");
    Ok(true)
}
