//! The Ln surface grammar, built from the combinator engine.
//!
//! Rule names here are the contract with the declaration and lowering
//! phases: those walk the parse tree by querying children with the names
//! given to `named`/`named_and`/`named_or` below. Recursive rules
//! (`assignables`, `statement`, `fulltypename`, `conditional`) are closed
//! with late-bound slots.

use std::rc::Rc;

use crate::{
    error::CompileResult,
    peg::{
        self, RuleRef, bind_slot, charset, choice, ident, kw, lit, named, named_and, named_or, not_charset, not_lit,
        opt, plus, seq, slot, star,
    },
};

// note: '.' sits between '-' and '/' in ASCII and must stay out of this
// set, or operator tokens would swallow method-chain dots
const OP_CHARS: &[(char, char)] = &[
    ('!', '!'),
    ('%', '&'),
    ('*', '+'),
    ('-', '-'),
    ('/', '/'),
    ('<', '?'),
    ('^', '^'),
    ('|', '|'),
    ('~', '~'),
];

const WS: &[(char, char)] = &[(' ', ' '), ('\t', '\t'), ('\n', '\n'), ('\r', '\r')];

pub(crate) struct Grammar {
    module: RuleRef,
}

impl Grammar {
    pub fn new() -> Self {
        let ows = star(charset("whitespace", WS));
        let rws = plus(charset("whitespace", WS));
        let digit = charset("digit", &[('0', '9')]);
        let name = || named("name", ident());
        let dotted = || named("dottedname", seq(vec![ident(), star(seq(vec![lit("."), ident()]))]));
        let opsymbol = || named("opsymbol", plus(charset("operator", OP_CHARS)));
        let any_char = not_charset("any character", &[]);

        // forward slots for the recursive rules
        let assignables_slot = slot();
        let statement_slot = slot();
        let fulltypename_slot = slot();
        let conditional_slot = slot();

        // --- constants ---------------------------------------------------
        let escaped = seq(vec![lit("\\"), Rc::clone(&any_char)]);
        let sq_body = star(choice(vec![escaped.clone(), not_lit("'")]));
        let dq_body = star(choice(vec![escaped, not_lit("\"")]));
        let strn = named(
            "str",
            choice(vec![
                seq(vec![lit("'"), sq_body, lit("'")]),
                seq(vec![lit("\""), dq_body, lit("\"")]),
            ]),
        );
        let num = named(
            "num",
            seq(vec![
                plus(Rc::clone(&digit)),
                opt(seq(vec![lit("."), plus(Rc::clone(&digit))])),
            ]),
        );
        let booln = named("bool", choice(vec![kw("true"), kw("false")]));
        let constants = named_or("constants", vec![booln, num, strn]);

        // --- assignables -------------------------------------------------
        let callargs = named(
            "callargs",
            seq(vec![
                Rc::clone(&assignables_slot),
                star(seq(vec![
                    ows.clone(),
                    lit(","),
                    ows.clone(),
                    Rc::clone(&assignables_slot),
                ])),
            ]),
        );
        let fncall = named_and(
            "fncall",
            vec![
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, lit("(")),
                (None, ows.clone()),
                (None, opt(callargs)),
                (None, ows.clone()),
                (None, lit(")")),
            ],
        );
        let variable = named("variable", ident());
        let group = named(
            "group",
            seq(vec![
                lit("("),
                ows.clone(),
                Rc::clone(&assignables_slot),
                ows.clone(),
                lit(")"),
            ]),
        );
        let baseassignable = named_or("baseassignable", vec![fncall, constants, variable, group]);
        let baseassignablelist = named(
            "baseassignablelist",
            seq(vec![
                baseassignable.clone(),
                star(seq(vec![ows.clone(), lit("."), ows.clone(), baseassignable])),
            ]),
        );
        let assignables = named(
            "assignables",
            seq(vec![
                choice(vec![opsymbol(), baseassignablelist.clone()]),
                star(seq(vec![
                    ows.clone(),
                    choice(vec![opsymbol(), baseassignablelist]),
                ])),
            ]),
        );
        bind_slot(&assignables_slot, assignables.clone());

        // --- types -------------------------------------------------------
        let genericargs = named(
            "genericargs",
            seq(vec![
                lit("<"),
                ows.clone(),
                Rc::clone(&fulltypename_slot),
                star(seq(vec![
                    ows.clone(),
                    lit(","),
                    ows.clone(),
                    Rc::clone(&fulltypename_slot),
                ])),
                ows.clone(),
                lit(">"),
            ]),
        );
        let fulltypename = named_and(
            "fulltypename",
            vec![
                (Some("typename"), seq(vec![ident(), star(seq(vec![lit("."), ident()]))])),
                (None, opt(genericargs)),
            ],
        );
        bind_slot(&fulltypename_slot, fulltypename.clone());

        let genericdecl = named(
            "genericdecl",
            seq(vec![
                lit("<"),
                ows.clone(),
                name(),
                star(seq(vec![ows.clone(), lit(","), ows.clone(), name()])),
                ows.clone(),
                lit(">"),
            ]),
        );
        let typeline = named_and(
            "typeline",
            vec![
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, lit(":")),
                (None, ows.clone()),
                (None, fulltypename.clone()),
            ],
        );
        let typebody = named(
            "typebody",
            seq(vec![
                lit("{"),
                ows.clone(),
                typeline.clone(),
                star(seq(vec![ows.clone(), lit(","), ows.clone(), typeline])),
                opt(seq(vec![ows.clone(), lit(",")])),
                ows.clone(),
                lit("}"),
            ]),
        );
        let typealias = named("typealias", seq(vec![lit("="), ows.clone(), fulltypename.clone()]));
        let typedecl = named_and(
            "typedecl",
            vec![
                (None, kw("type")),
                (None, rws.clone()),
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, opt(genericdecl)),
                (None, ows.clone()),
                (None, named_or("typedef", vec![typebody, typealias])),
            ],
        );

        // --- interfaces --------------------------------------------------
        let typelist = named(
            "typelist",
            seq(vec![
                fulltypename.clone(),
                star(seq(vec![ows.clone(), lit(","), ows.clone(), fulltypename.clone()])),
            ]),
        );
        let fixity = || named("fixity", choice(vec![kw("prefix"), kw("infix")]));
        let operatorreq = named_and(
            "operatorreq",
            vec![
                (None, fixity()),
                (None, rws.clone()),
                (None, opsymbol()),
                (None, ows.clone()),
                (None, lit("(")),
                (None, ows.clone()),
                (None, typelist.clone()),
                (None, ows.clone()),
                (None, lit(")")),
                (None, ows.clone()),
                (None, lit(":")),
                (None, ows.clone()),
                (None, named("rettype", fulltypename.clone())),
            ],
        );
        let fnreq = named_and(
            "fnreq",
            vec![
                (None, opt(seq(vec![kw("fn"), rws.clone()]))),
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, lit("(")),
                (None, ows.clone()),
                (None, opt(typelist)),
                (None, ows.clone()),
                (None, lit(")")),
                (None, ows.clone()),
                (None, lit(":")),
                (None, ows.clone()),
                (None, named("rettype", fulltypename.clone())),
            ],
        );
        let propreq = named_and(
            "propreq",
            vec![
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, lit(":")),
                (None, ows.clone()),
                (None, fulltypename.clone()),
            ],
        );
        let interfaceline = named_or("interfaceline", vec![operatorreq, fnreq, propreq]);
        let interfacedecl = named_and(
            "interfacedecl",
            vec![
                (None, kw("interface")),
                (None, rws.clone()),
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, lit("{")),
                (None, ows.clone()),
                (None, star(seq(vec![interfaceline, ows.clone()]))),
                (None, lit("}")),
            ],
        );

        // --- module-level declarations -----------------------------------
        let typehint = opt(seq(vec![
            lit(":"),
            ows.clone(),
            fulltypename.clone(),
            ows.clone(),
        ]));
        let constdecl = named_and(
            "constdecl",
            vec![
                (None, kw("const")),
                (None, rws.clone()),
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, typehint.clone()),
                (None, lit("=")),
                (None, ows.clone()),
                (None, assignables.clone()),
                (None, ows.clone()),
                (None, lit(";")),
            ],
        );
        let eventdecl = named_and(
            "eventdecl",
            vec![
                (None, kw("event")),
                (None, rws.clone()),
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, lit(":")),
                (None, ows.clone()),
                (None, fulltypename.clone()),
                (None, ows.clone()),
                (None, opt(lit(";"))),
            ],
        );

        // --- statements --------------------------------------------------
        let declaration = named_and(
            "declaration",
            vec![
                (None, named("declkind", choice(vec![kw("const"), kw("let")]))),
                (None, rws.clone()),
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, typehint.clone()),
                (None, lit("=")),
                (None, ows.clone()),
                (None, assignables.clone()),
                (None, ows.clone()),
                (None, lit(";")),
            ],
        );
        let assignment = named_and(
            "assignment",
            vec![
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, lit("=")),
                (None, peg::not_ahead(charset("operator", OP_CHARS))),
                (None, ows.clone()),
                (None, assignables.clone()),
                (None, ows.clone()),
                (None, lit(";")),
            ],
        );
        let emitstmt = named_and(
            "emitstmt",
            vec![
                (None, kw("emit")),
                (None, rws.clone()),
                (Some("eventname"), seq(vec![ident(), star(seq(vec![lit("."), ident()]))])),
                (None, opt(seq(vec![rws.clone(), assignables.clone()]))),
                (None, ows.clone()),
                (None, opt(lit(";"))),
            ],
        );
        let exitstmt = named_and(
            "exitstmt",
            vec![
                (None, kw("return")),
                (None, opt(seq(vec![rws.clone(), assignables.clone()]))),
                (None, ows.clone()),
                (None, opt(lit(";"))),
            ],
        );
        let assignablestmt = named_and(
            "assignablestmt",
            vec![(None, assignables.clone()), (None, ows.clone()), (None, lit(";"))],
        );
        let functionbody = named(
            "functionbody",
            seq(vec![
                lit("{"),
                ows.clone(),
                star(seq(vec![Rc::clone(&statement_slot), ows.clone()])),
                lit("}"),
            ]),
        );
        let blocklike = choice(vec![functionbody.clone(), Rc::clone(&statement_slot)]);
        let conditional = named_and(
            "conditional",
            vec![
                (None, kw("if")),
                (None, rws.clone()),
                (None, assignables.clone()),
                (None, ows.clone()),
                (Some("ifbranch"), blocklike.clone()),
                (
                    None,
                    opt(seq(vec![
                        ows.clone(),
                        kw("else"),
                        ows.clone(),
                        named(
                            "elsebranch",
                            choice(vec![Rc::clone(&conditional_slot), blocklike]),
                        ),
                    ])),
                ),
            ],
        );
        bind_slot(&conditional_slot, conditional.clone());
        let statement = named_or(
            "statement",
            vec![
                declaration,
                assignment,
                conditional,
                emitstmt,
                exitstmt,
                assignablestmt,
            ],
        );
        bind_slot(&statement_slot, statement);

        // --- functions, operators, handlers ------------------------------
        let param = named_and(
            "param",
            vec![
                (Some("name"), ident()),
                (None, ows.clone()),
                (None, lit(":")),
                (None, ows.clone()),
                (None, fulltypename.clone()),
            ],
        );
        let paramlist = named(
            "paramlist",
            seq(vec![
                param.clone(),
                star(seq(vec![ows.clone(), lit(","), ows.clone(), param])),
            ]),
        );
        let assignfunction = named(
            "assignfunction",
            seq(vec![lit("="), ows.clone(), assignables.clone(), ows.clone(), lit(";")]),
        );
        let functions = named_and(
            "functions",
            vec![
                (None, kw("fn")),
                (None, opt(seq(vec![rws.clone(), name()]))),
                (None, ows.clone()),
                (None, lit("(")),
                (None, ows.clone()),
                (None, opt(paramlist)),
                (None, ows.clone()),
                (None, lit(")")),
                (None, ows.clone()),
                (
                    None,
                    opt(seq(vec![
                        lit(":"),
                        ows.clone(),
                        named("rettype", fulltypename.clone()),
                        ows.clone(),
                    ])),
                ),
                (None, named_or("fnbody", vec![functionbody.clone(), assignfunction])),
            ],
        );
        let opmap = named_and(
            "opmap",
            vec![
                (None, fixity()),
                (None, rws.clone()),
                (Some("fnname"), ident()),
                (None, rws.clone()),
                (None, kw("as")),
                (None, rws.clone()),
                (None, opsymbol()),
                (None, rws.clone()),
                (None, kw("precedence")),
                (None, rws.clone()),
                (None, named("opprecedence", plus(digit))),
                (None, ows.clone()),
                (None, opt(lit(";"))),
            ],
        );
        let handler = named_and(
            "handlers",
            vec![
                (None, kw("on")),
                (None, rws.clone()),
                (Some("eventname"), seq(vec![ident(), star(seq(vec![lit("."), ident()]))])),
                (None, rws.clone()),
                (
                    None,
                    named_or(
                        "handlerdef",
                        vec![functions.clone(), functionbody, named("fnname", dotted())],
                    ),
                ),
            ],
        );

        // --- imports and the module root ---------------------------------
        let depchars = plus(charset(
            "dependency path",
            &[('-', '9'), ('A', 'Z'), ('_', '_'), ('a', 'z')],
        ));
        let dependency = named_or(
            "dependency",
            vec![
                named(
                    "localdependency",
                    seq(vec![choice(vec![lit("./"), lit("../")]), depchars.clone()]),
                ),
                named("globaldependency", seq(vec![lit("@"), depchars])),
            ],
        );
        let renamed = opt(seq(vec![rws.clone(), kw("as"), rws.clone(), named("rename", ident())]));
        let standardimport = named_and(
            "standardimport",
            vec![
                (None, kw("import")),
                (None, rws.clone()),
                (None, dependency.clone()),
                (None, renamed.clone()),
            ],
        );
        let importitem = named_and("importitem", vec![(Some("name"), ident()), (None, renamed)]);
        let fromimport = named_and(
            "fromimport",
            vec![
                (None, kw("from")),
                (None, rws.clone()),
                (None, dependency),
                (None, rws.clone()),
                (None, kw("import")),
                (None, rws.clone()),
                (None, importitem.clone()),
                (None, star(seq(vec![ows.clone(), lit(","), ows.clone(), importitem]))),
            ],
        );
        let importstmt = named_or("importstmt", vec![standardimport, fromimport]);

        let exportable = named_or(
            "exportable",
            vec![
                typedecl.clone(),
                interfacedecl.clone(),
                constdecl.clone(),
                eventdecl.clone(),
                functions.clone(),
                opmap.clone(),
                named("reexport", ident()),
            ],
        );
        let exportdecl = named_and(
            "exportdecl",
            vec![(None, kw("export")), (None, rws.clone()), (None, exportable)],
        );
        let moduleitem = named_or(
            "moduleitem",
            vec![
                exportdecl,
                typedecl,
                interfacedecl,
                constdecl,
                eventdecl,
                functions,
                opmap,
                handler,
            ],
        );
        let module = named_and(
            "module",
            vec![
                (None, ows.clone()),
                (None, star(seq(vec![importstmt, ows.clone()]))),
                (None, star(seq(vec![moduleitem, ows]))),
            ],
        );

        Self { module }
    }
}

/// Parses one Ln source file into its tagged tree.
pub(crate) fn parse_module(src: &str, file: &str) -> CompileResult<Rc<peg::Node>> {
    let grammar = Grammar::new();
    peg::parse(&grammar.module, src, file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hello_world() {
        let src = "from @std/app import start, print, exit\n\non start {\n  print('Hello, World!');\n  emit exit 0;\n}\n";
        let tree = parse_module(src, "hello.ln").unwrap();
        assert_eq!(tree.get_all("importstmt").len(), 1);
        let items = tree.get_all("moduleitem");
        assert_eq!(items.len(), 1);
        assert!(items[0].has("handlers"));
    }

    #[test]
    fn parses_declarations_and_operators() {
        let src = "const half: float64 = 1 / 2;\nexport fn double(x: int64): int64 = x * 2;\n";
        let tree = parse_module(src, "m.ln").unwrap();
        assert_eq!(tree.get_all("moduleitem").len(), 2);
    }

    #[test]
    fn parses_blockless_conditional() {
        let src = "fn f(n: int64): int64 { if n < 2 return 1 else return f(n - 1) + f(n - 2) }\n";
        let tree = parse_module(src, "m.ln").unwrap();
        let item = tree.get_all("moduleitem")[0];
        let fun = item.get("functions").unwrap();
        let body = fun.get("fnbody").unwrap().get("functionbody").unwrap();
        let stmt = body.get_all("statement")[0];
        let cond = stmt.get("conditional").unwrap();
        assert!(cond.get("ifbranch").unwrap().has("statement"));
        assert!(cond.get("elsebranch").unwrap().has("statement"));
    }

    #[test]
    fn parses_types_interfaces_events() {
        let src = concat!(
            "export type Point<A> { x: A, y: A }\n",
            "type Alias = Point<int64>\n",
            "export interface Stringifiable { toString(Stringifiable): string }\n",
            "export event aNumber: int64;\n",
            "export infix add as + precedence 2\n",
        );
        let tree = parse_module(src, "m.ln").unwrap();
        assert_eq!(tree.get_all("moduleitem").len(), 5);
    }

    #[test]
    fn method_chains_and_nested_calls() {
        let src = "on start { print('n = ' + f(n.toString(), 2).trim()); }\n";
        assert!(parse_module(src, "m.ln").is_ok());
    }

    #[test]
    fn reports_deepest_failure() {
        let src = "on start {\n  const x = ;\n}\n";
        let err = parse_module(src, "m.ln").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("m.ln"), "message should name the file: {msg}");
        assert!(msg.contains('2'), "message should carry the line: {msg}");
    }
}
