//! Module loading: import-graph resolution, topological processing, cycle
//! detection, and the bundled standard library.
//!
//! A module is declared only after every dependency it names has been
//! declared. The std `root` module always loads first (everything else
//! depends on its exports); remaining `@std/…` modules load on first
//! reference. User modules chain to the published root exports but never to
//! the opcode catalog.

use std::{
    path::{Path, PathBuf},
    rc::Rc,
};

use log::debug;

use crate::{
    error::{CompileError, CompileResult},
    grammar,
    module::declare_module,
    peg::Node,
    program::{ModuleInfo, Program},
    scope::{Binding, ScopeId},
};

const STD_SOURCES: &[(&str, &str)] = &[
    ("root", include_str!("std/root.lnn")),
    ("app", include_str!("std/app.lnn")),
];

/// Compiler configuration. The bundled std sources are always available;
/// `std_dir` overrides them with on-disk `.lnn`/`.ln` files for out-of-tree
/// std experiments.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub std_dir: Option<PathBuf>,
}

/// Loads the std root and the module graph rooted at `path`.
pub(crate) fn load_entry_file(prog: &mut Program, path: &Path, options: &CompileOptions) -> CompileResult<()> {
    load_std(prog, "root", options)?;
    let mut visiting = Vec::new();
    load_user_file(prog, path, &mut visiting, options)?;
    Ok(())
}

/// Loads the std root and an in-memory entry module. String input has no
/// directory, so only `@std/…` imports are available to it.
pub(crate) fn load_entry_string(prog: &mut Program, source: &str, options: &CompileOptions) -> CompileResult<()> {
    load_std(prog, "root", options)?;
    let tree = grammar::parse_module(source, "<input>")?;
    for import in tree.get_all("importstmt") {
        let (dep, _) = import_dependency(import);
        if !dep.starts_with('@') {
            return Err(CompileError::name(
                format!("Cannot resolve local import {dep}: string input has no directory"),
                Some(import.loc()),
            ));
        }
    }
    load_std_deps(prog, &tree, options)?;
    declare_loaded(prog, &tree, "<input>", false)
}

fn load_user_file(
    prog: &mut Program,
    path: &Path,
    visiting: &mut Vec<String>,
    options: &CompileOptions,
) -> CompileResult<()> {
    let canonical = path
        .canonicalize()
        .map_err(|e| io_error(path, &e))?
        .to_string_lossy()
        .into_owned();
    if prog.modules.contains_key(&canonical) {
        return Ok(());
    }
    if let Some(at) = visiting.iter().position(|v| *v == canonical) {
        let mut cycle: Vec<String> = visiting[at..].to_vec();
        cycle.push(canonical);
        return Err(CompileError::ModuleCycle { cycle });
    }
    visiting.push(canonical.clone());
    debug!("loading module {canonical}");

    let source = std::fs::read_to_string(path).map_err(|e| io_error(path, &e))?;
    let tree = grammar::parse_module(&source, &canonical)?;

    // depth-first over dependencies so processing order is topological
    let dir = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    for import in tree.get_all("importstmt") {
        let (dep, _) = import_dependency(import);
        if let Some(std_name) = dep.strip_prefix("@std/") {
            load_std(prog, std_name, options)?;
        } else if dep.starts_with('@') {
            return Err(CompileError::name(
                format!("Unknown global import {dep}"),
                Some(import.loc()),
            ));
        } else {
            let dep_path = local_path(&dir, &dep);
            load_user_file(prog, &dep_path, visiting, options)?;
        }
    }

    declare_loaded(prog, &tree, &canonical, false)?;
    visiting.pop();
    Ok(())
}

/// Loads one std module by short name (`root`, `app`, …).
fn load_std(prog: &mut Program, name: &str, options: &CompileOptions) -> CompileResult<()> {
    let key = format!("@std/{name}");
    if prog.modules.contains_key(&key) {
        return Ok(());
    }
    debug!("loading std module {key}");
    let source = read_std_source(name, options)?;
    let tree = grammar::parse_module(&source, &key)?;
    load_std_deps(prog, &tree, options)?;
    declare_loaded(prog, &tree, &key, true)?;
    if name == "root" {
        let exports = prog.modules[&key].exports;
        prog.publish_std_root(exports);
    }
    Ok(())
}

fn load_std_deps(prog: &mut Program, tree: &Rc<Node>, options: &CompileOptions) -> CompileResult<()> {
    for import in tree.get_all("importstmt") {
        let (dep, _) = import_dependency(import);
        match dep.strip_prefix("@std/") {
            Some(std_name) => load_std(prog, std_name, options)?,
            None => {
                return Err(CompileError::name(
                    format!("std modules may only import @std dependencies, found {dep}"),
                    Some(import.loc()),
                ));
            }
        }
    }
    Ok(())
}

fn read_std_source(name: &str, options: &CompileOptions) -> CompileResult<String> {
    if let Some(dir) = &options.std_dir {
        for ext in ["lnn", "ln"] {
            let candidate = dir.join(format!("{name}.{ext}"));
            if candidate.is_file() {
                return std::fs::read_to_string(&candidate).map_err(|e| io_error(&candidate, &e));
            }
        }
    }
    STD_SOURCES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, src)| (*src).to_string())
        .ok_or_else(|| CompileError::name(format!("@std/{name} is not a standard library module"), None))
}

/// Builds the scope pair for a parsed module, wires its imports, declares
/// its items, and registers it.
fn declare_loaded(prog: &mut Program, tree: &Rc<Node>, key: &str, is_std: bool) -> CompileResult<()> {
    let parent = if is_std && key == "@std/root" {
        prog.root_scope
    } else {
        prog.user_root_scope
    };
    let secondary = if is_std { Some(prog.opcode_scope) } else { None };
    let module_scope = prog.scopes.add(Some(parent), secondary);
    let export_scope = prog.scopes.add(Some(module_scope), None);

    let base_dir = Path::new(key).parent().map(Path::to_path_buf);
    for import in tree.get_all("importstmt") {
        wire_import(prog, module_scope, import, base_dir.as_deref())?;
    }
    declare_module(prog, tree, module_scope, export_scope)?;
    prog.modules
        .insert(key.to_string(), ModuleInfo { exports: export_scope });
    Ok(())
}

/// Inserts the bindings an import statement names into the module scope.
/// Dependencies were loaded before this runs, so the registry lookup is
/// infallible for well-formed graphs.
fn wire_import(prog: &mut Program, scope: ScopeId, import: &Rc<Node>, base_dir: Option<&Path>) -> CompileResult<()> {
    let (dep, node) = import_dependency(import);
    let key = if dep.starts_with('@') {
        dep.clone()
    } else {
        let dir = base_dir.ok_or_else(|| {
            CompileError::name(
                format!("Cannot resolve local import {dep}: string input has no directory"),
                Some(node.loc()),
            )
        })?;
        local_path(dir, &dep)
            .canonicalize()
            .map_err(|e| io_error(&local_path(dir, &dep), &e))?
            .to_string_lossy()
            .into_owned()
    };
    let info = prog.modules.get(&key).cloned().unwrap_or_else(|| {
        unreachable!("import {key} resolved before module declaration");
    });

    if let Some(standard) = import.get("standardimport") {
        let local = standard
            .get("rename")
            .map_or_else(|| dep_stem(&dep), |r| r.text().to_string());
        prog.scopes.put(scope, &local, Binding::Module(info.exports));
    } else {
        let from = import.get("fromimport").expect("importstmt alternatives");
        for item in from.get_all("importitem") {
            let name = item.get("name").expect("importitem has a name").text();
            let local = item.get("rename").map_or(name, |r| r.text());
            let Some(binding) = prog.scopes.shallow_get(info.exports, name).cloned() else {
                return Err(CompileError::name(
                    format!("{name} is not a type, function, or value exported by {dep}"),
                    Some(item.loc()),
                ));
            };
            prog.scopes.put(scope, local, binding);
        }
    }
    Ok(())
}

/// The dependency string of an import statement and the node carrying it.
fn import_dependency(import: &Rc<Node>) -> (String, &Rc<Node>) {
    let inner = import
        .get("standardimport")
        .or_else(|| import.get("fromimport"))
        .expect("importstmt alternatives");
    let dep = inner.get("dependency").expect("imports name a dependency");
    (dep.text().trim().to_string(), dep)
}

/// Resolves `./x` / `../x` against the importing file's directory, adding
/// the `.ln` extension when absent.
fn local_path(dir: &Path, dep: &str) -> PathBuf {
    let mut path = dir.join(dep);
    if path.extension().is_none() {
        path.set_extension("ln");
    }
    path
}

/// Local name bound by a standard import: the last path segment.
fn dep_stem(dep: &str) -> String {
    dep.rsplit('/').next().unwrap_or(dep).trim_end_matches(".ln").to_string()
}

fn io_error(path: &Path, err: &std::io::Error) -> CompileError {
    CompileError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}
