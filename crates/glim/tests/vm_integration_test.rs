mod common;

use common::run_ok;

#[test]
fn arithmetic_with_precedence() {
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run_ok("var a = \"he\"; var b = \"llo\"; print a + b;"), "hello\n");
}

#[test]
fn for_loop_counts() {
    assert_eq!(run_ok("for (var i = 0; i < 3; i = i + 1) print i;"), "0\n1\n2\n");
}

#[test]
fn closures_share_state() {
    let source = "\
fun outer() {
  var x = 1;
  fun inner() { x = x + 1; print x; }
  return inner;
}
var f = outer(); f(); f(); f();
";
    assert_eq!(run_ok(source), "2\n3\n4\n");
}

#[test]
fn class_with_method_and_field() {
    let source = "\
class C { greet() { print \"hi \" + this.who; } }
var c = C(); c.who = \"world\"; c.greet();
";
    assert_eq!(run_ok(source), "hi world\n");
}

#[test]
fn blocks_leave_the_stack_balanced() {
    // If scope exit leaked or over-popped slots, the surrounding locals
    // would be corrupted.
    let source = "\
{
  var a = 1;
  { var b = 2; var c = 3; print b + c; }
  { var d = 4; }
  print a;
}
print \"done\";
";
    assert_eq!(run_ok(source), "5\n1\ndone\n");
}

#[test]
fn assignment_leaves_the_new_value() {
    assert_eq!(run_ok("var x = 1; print x;"), "1\n");
    assert_eq!(run_ok("var x = 1; x = 2; print x;"), "2\n");
}

#[test]
fn nested_calls_return_through_every_frame() {
    let source = "\
fun add(a, b) { return a + b; }
fun twice(n) { return add(n, n); }
print twice(add(2, 3));
";
    assert_eq!(run_ok(source), "10\n");
}

#[test]
fn methods_on_separate_instances_are_independent() {
    let source = "\
class Counter {
  bump() { this.n = this.n + 1; return this.n; }
}
var a = Counter(); a.n = 0;
var b = Counter(); b.n = 10;
a.bump(); a.bump();
b.bump();
print a.n;
print b.n;
";
    assert_eq!(run_ok(source), "2\n11\n");
}

#[test]
fn while_with_logical_condition() {
    let source = "\
var i = 0;
while (i < 5 and true) { i = i + 1; }
print i;
";
    assert_eq!(run_ok(source), "5\n");
}

#[test]
fn repl_style_sessions_keep_globals() {
    let mut session = glim::Session::new();
    let mut out = Vec::new();
    session.eval("var greeting = \"hello\";", &mut out).unwrap();
    session.eval("print greeting;", &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "hello\n");
}

#[test]
fn session_survives_a_runtime_error() {
    let mut session = glim::Session::new();
    let mut out = Vec::new();
    session.eval("var x = 1;", &mut out).unwrap();
    assert!(session.eval("oops();", &mut out).is_err());
    session.eval("print x;", &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "1\n");
}
